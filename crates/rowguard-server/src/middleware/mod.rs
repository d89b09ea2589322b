pub mod boundary;
pub mod propagation;
