pub mod pcsc;
pub mod transport;

pub use self::pcsc::PcscTransport;
pub use self::transport::Transport;
