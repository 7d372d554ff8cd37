pub mod capi;
pub mod packet;
