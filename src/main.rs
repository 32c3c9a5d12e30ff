use camview::camera::CaptureSource;
use camview::gui;
use camview::preview;

fn main() {
    camview::init_logger!();

    gui::run(|| -> anyhow::Result<()> {
        let source = CaptureSource::open()?;
        log::info!("previewing {} camera(s), press 'q' to quit", source.cameras());
        preview::run(source, &mut gui::GuiSink)?;
        Ok(())
    })
}
