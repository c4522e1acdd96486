pub mod cipher;
pub mod clear;
pub mod config;
pub mod crypto;
pub mod decrypt;
pub mod encrypt;
pub mod esp;
pub mod keying;
pub mod keys;
pub mod packet;
pub mod proc;
pub mod replay;
pub mod ring;
pub mod shm;
pub mod state;
pub mod status;
pub mod tun;

// Re-export the types the binaries and tests reach for most.
pub use cipher::Cipher;
pub use config::Config;
pub use esp::{EspHeader, Sa};
pub use keys::KeyCell;
pub use packet::{Packet, PacketPool};
pub use proc::{ProcIo, Stage};
pub use replay::ReplayWindow;
pub use ring::Ring;
pub use shm::Shared;
pub use state::SharedState;
