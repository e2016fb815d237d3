use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use inbox_sync::app::{InboxDetailPresenter, InboxListPresenter, Navigator};
use inbox_sync::config::Config;
use inbox_sync::core::cache::CacheHandle;
use inbox_sync::core::images::ImageLoader;
use inbox_sync::core::remote::HttpInboxSource;
use inbox_sync::core::store::MessageStore;
use inbox_sync::core::sync::InboxSyncEngine;
use inbox_sync::ui::{TerminalDetail, TerminalList};

const HELP: &str = "commands: r = refresh, <n> = open message n, b = back, d = dismiss error, q = quit";

/// Posts selected ids back to the main loop.
struct ChannelNavigator(mpsc::UnboundedSender<String>);

impl Navigator for ChannelNavigator {
    fn open_detail(&mut self, id: &str) {
        let _ = self.0.send(id.to_string());
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::resolve() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let source = match HttpInboxSource::new(&config) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let cache = if config.persist {
        match CacheHandle::open() {
            Ok(cache) => Some(cache),
            Err(e) => {
                log::warn!("Cache unavailable, running in memory: {}", e);
                None
            }
        }
    } else {
        None
    };

    let engine = InboxSyncEngine::new(source.clone(), Arc::new(MessageStore::new()), cache);
    if let Err(e) = engine.restore_from_cache().await {
        log::warn!("Failed to restore inbox cache: {}", e);
    }
    let images = ImageLoader::new(source, config.image_cache_capacity);

    let (nav_tx, mut nav_rx) = mpsc::unbounded_channel();
    let (mut list, mut list_rx) =
        InboxListPresenter::new(engine.clone(), TerminalList, ChannelNavigator(nav_tx));
    let (mut detail, mut detail_rx) = InboxDetailPresenter::new(engine, images, TerminalDetail);

    println!("{HELP}");
    list.on_appear();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = list_rx.recv() => list.handle(event),
            Some(event) = detail_rx.recv() => detail.handle(event),
            Some(id) = nav_rx.recv() => detail.activate(&id),
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("stdin: {}", e);
                        break;
                    }
                };
                match line.trim() {
                    "q" => break,
                    "r" => {
                        list.on_pull_to_refresh();
                    }
                    "b" => {
                        detail.deactivate();
                        list.render();
                    }
                    "d" => list.dismiss_error(),
                    "" => {}
                    other => match other.parse::<usize>() {
                        Ok(n) if n >= 1 => {
                            if list.on_select(n - 1).is_none() {
                                println!("no message {n}");
                            }
                        }
                        _ => println!("{HELP}"),
                    },
                }
            }
        }
    }

    detail.deactivate();
}
