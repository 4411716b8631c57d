mod api;
mod ui;

use probe::eyre;

#[probe::main]
#[tokio::main]
async fn main() -> eyre::Result<()> {
    let runner = run();
    let app = probe::App::new();
    app.run(runner).await?;
    Ok(())
}
