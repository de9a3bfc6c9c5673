//! C5 Cipher Engines: hybrid RSA-OAEP+AES-256-GCM and OpenPGP (spec §4.5).

pub mod hybrid;
pub mod openpgp;
