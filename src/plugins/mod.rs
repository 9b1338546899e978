pub mod nic;
pub mod volume;
