mod adapter_console;

use sakisaki::Bot;
use sakisaki::sakisaki::SakiSakiPlugin;

use adapter_console::ConsoleAdapter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bot = Bot::builder()
        .config_path("config.toml")
        .data_dir("data")
        .adapter(ConsoleAdapter::default())
        .plugin(SakiSakiPlugin::new())
        .build();

    bot.run().await?;
    Ok(())
}
