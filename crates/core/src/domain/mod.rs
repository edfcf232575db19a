pub mod channel;
pub mod profile;
pub mod session;
pub mod tool;
