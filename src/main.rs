use std::path::PathBuf;

use kinescope::{app, logging};

fn main() -> anyhow::Result<()> {
    logging::init(log::LevelFilter::Info);
    let rom = std::env::args_os().nth(1).map(PathBuf::from);

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1024.0, 720.0])
            .with_min_inner_size([640.0, 480.0])
            .with_title("Kinescope"),
        vsync: true,
        ..Default::default()
    };

    eframe::run_native(
        "Kinescope",
        options,
        Box::new(move |cc| Ok(Box::new(app::NesApp::new(cc, rom)))),
    )
    .map_err(|err| anyhow::anyhow!("failed to run app: {err}"))
}
