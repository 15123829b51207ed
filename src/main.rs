mod app;

use color_eyre::Result;
use app::App;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let app = App::new();
    app.run()?;

    Ok(())
}
