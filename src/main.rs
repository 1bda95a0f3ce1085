mod cli;

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;

use cli::{Cli, Command};
use pin_pix::config::Config;
use pin_pix::db::{Coordinate, PhotoId};
use pin_pix::SyncEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config =
        Config::from_env().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!("Database: {}", config.db_path);

    let engine = SyncEngine::from_config(&config)
        .await
        .context("Failed to initialize sync engine")?;
    spawn_change_logger(&engine);

    match cli.command {
        Command::Add {
            latitude,
            longitude,
        } => {
            let location = engine
                .create_location(Coordinate::new(latitude, longitude)?)
                .await?;
            println!("{}", location.id);
        }
        Command::List => {
            for location in engine.locations().await? {
                let count = engine.store().count_photos(location.id).await?;
                println!(
                    "{}\t{}\t{} photo(s)",
                    location.id,
                    location.coordinate(),
                    count
                );
            }
        }
        Command::Photos { location } => {
            for photo in engine.ensure_loaded(location).await? {
                let cached = if photo.has_image() { "cached" } else { "-" };
                println!("{}\t{}\t{}", photo.remote_id, cached, photo.image_url);
            }
        }
        Command::Refresh { location } => {
            let photos = engine.refresh(location).await?;
            println!("{} photo(s)", photos.len());
        }
        Command::Delete { location, photos } => {
            let removed = engine.delete_photos(location, photos).await?;
            println!("Deleted {} photo(s)", removed.len());
        }
        Command::Remove { location } => {
            if !engine.delete_location(location).await? {
                anyhow::bail!("No location with id {}", location);
            }
        }
        Command::Download { location } => download_all(&engine, location).await?,
    }

    Ok(())
}

async fn download_all(engine: &SyncEngine, location: i64) -> anyhow::Result<()> {
    let photos = engine.ensure_loaded(location).await?;

    let mut tasks = JoinSet::new();
    for photo in photos {
        let engine = engine.clone();
        tasks.spawn(async move {
            let id = PhotoId::new(photo.location_id, photo.remote_id);
            let result = engine.ensure_image_loaded(&id).await;
            (id, result)
        });
    }

    let (mut loaded, mut failed) = (0usize, 0usize);
    while let Some(joined) = tasks.join_next().await {
        let (id, result) = joined.context("Download task panicked")?;
        match result {
            Ok(bytes) => {
                debug!("{}: {} bytes", id, bytes.len());
                loaded += 1;
            }
            Err(e) => {
                warn!("{}: {}", id, e);
                failed += 1;
            }
        }
    }

    println!("{} image(s) cached, {} failed", loaded, failed);
    Ok(())
}

fn spawn_change_logger(engine: &SyncEngine) {
    let mut changes = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(batch) => debug!(
                    "Location {}: {} change(s)",
                    batch.location_id,
                    batch.events.len()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Change logger skipped {} batch(es)", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
