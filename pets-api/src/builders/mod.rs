pub mod ensemble;
pub mod mpc;
