pub mod buf;
pub mod random;
pub mod sync;
