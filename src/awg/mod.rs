pub mod client;
pub mod generator_impl;
pub mod transport;
#[cfg(feature = "visa")]
pub mod visa;

pub use client::{parse_error_queue, Awg, ChannelData, CHANNEL_COUNT};
pub use transport::{
    definite_length_block, encode_f32_le, is_instr_resource, parse_resource, validate_resource,
    ConnectionConfig, ScpiLink, ScpiTransport, TcpScpiTransport, TcpScpiTransportBuilder,
    DEFAULT_SCPI_PORT,
};
#[cfg(feature = "visa")]
pub use visa::VisaScpiTransport;
