//! Architecture-dependent register encodings and target descriptions.

pub mod features;
pub mod registers;

pub use registers::{
    read_register, register_count, write_register, AARCH32_REGISTER_COUNT,
    AARCH64_REGISTER_COUNT, FPCR_MASK,
};
