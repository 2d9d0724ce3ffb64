//! Settings and on-disk layout

pub mod layout;
pub mod settings;
