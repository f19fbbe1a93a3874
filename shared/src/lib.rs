#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc; // gives Vec and String

pub mod events;
pub mod constants;
