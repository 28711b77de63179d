// Preview path and thumbnail output.

pub mod controller;
pub mod thumbnail;
