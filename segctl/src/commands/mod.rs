pub mod mount;
pub mod register;
pub mod rendezvous;
pub mod segment;
