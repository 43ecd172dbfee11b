//! One runner per supported language

pub mod c;
pub mod cpp;
pub mod java;
pub mod native;
pub mod python;
