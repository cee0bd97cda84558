mod adapter_console;
mod plugin_menu;

use caidan::Bot;

use adapter_console::ConsoleAdapter;
use plugin_menu::MenuPlugin;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bot = Bot::builder()
        .config_path("config.toml")
        .data_dir("data")
        .adapter(ConsoleAdapter::default())
        .plugin(MenuPlugin::new())
        .build();

    bot.run().await?;
    Ok(())
}
