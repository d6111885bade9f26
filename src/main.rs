use plexus::{config, cooldown, db, logger, server};

#[tokio::main]
async fn main() {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => s.to_string(),
            None => panic_info
                .payload()
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "unknown panic payload".to_string()),
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error("panic", &format!("PANIC: {} at {}", message, location));
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    db::init();
    logger::init();
    config::init();
    cooldown::global().load_persisted();
    logger::info("app", "gateway started");
    server::serve().await;
}
