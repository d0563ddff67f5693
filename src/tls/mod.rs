//! Optional TLS transport (feature `tls-rustls`).

pub mod rustls;

#[cfg(feature = "tls-rustls")]
pub use self::rustls::{MaybeTlsStream, maybe_upgrade};
