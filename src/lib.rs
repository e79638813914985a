pub mod app;
pub mod audio;
pub mod logging;
pub mod nes;
