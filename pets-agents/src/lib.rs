pub mod cem;
pub mod ensemble;
pub mod mpc;
