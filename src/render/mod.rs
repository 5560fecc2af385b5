/// Frame buffer and rendered frame types.
pub mod frame;
