pub mod multiharp;
pub mod settings;

pub use multiharp::MultiHarp;
pub use settings::MultiHarpSettings;
