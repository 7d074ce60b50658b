pub mod netns;

pub use netns::{Netns, NetnsRef};
