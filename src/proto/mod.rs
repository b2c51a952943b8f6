//! Pieces pertaining to the HTTP message protocol.

pub(crate) mod h1;
