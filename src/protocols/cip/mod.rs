// src/protocols/cip/mod.rs - EtherNet/IP and CIP explicit messaging
pub mod epath;
pub mod frame;
pub mod message;
pub mod session;
pub mod status;

pub use frame::{Encapsulation, EncapsulationCodec};
pub use message::{Reply, ResponseKind};
pub use session::CipSession;
