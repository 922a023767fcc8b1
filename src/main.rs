//! pin-album: drop map pins and keep a locally cached album of nearby
//! photos for each.
//!
//! Pins and downloaded images live in a SQLite database. Opening an album
//! with no cached photos searches Flickr around the pin, picks a random page
//! of results, and downloads the images concurrently; refreshing replaces the
//! album with a new page. Only one fetch runs per pin at a time.

#![warn(clippy::all)]

mod cli;
mod config;
mod region;
mod shutdown;
mod source;
mod store;
mod sync;
mod types;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{AlbumCommand, Command, PhotoCommand, PinCommand, RegionCommand};
use config::Config;
use region::{MapRegion, RegionCache};
use store::{ChangeEvent, Coordinate, Photo, PhotoId, PinId, PinStore, SqlitePinStore};
use sync::{AlbumSyncEngine, SyncOutcome};

/// Create a progress bar with a consistent template.
///
/// Hidden when the user passed `--no-progress-bar` or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb
}

fn parse_coordinate(args: cli::CoordinateArgs) -> anyhow::Result<Coordinate> {
    let coordinate = Coordinate::new(args.lat, args.lon);
    if !coordinate.is_valid() {
        anyhow::bail!(
            "Invalid coordinate {}: latitude must be within ±90 and longitude within ±180",
            coordinate
        );
    }
    Ok(coordinate)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<SqlitePinStore>> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    let db_path = config.db_path();
    let store = SqlitePinStore::open(&db_path).await?;
    tracing::debug!("Album database opened at {}", db_path.display());
    Ok(Arc::new(store))
}

fn build_engine(
    store: Arc<SqlitePinStore>,
    config: &Config,
    api_key: String,
) -> anyhow::Result<Arc<AlbumSyncEngine>> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("pin-album/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let source = Arc::new(source::FlickrSource::new(
        client,
        api_key,
        config.search_settings(),
    ));
    Ok(Arc::new(AlbumSyncEngine::new(
        store,
        source,
        config.sync_config(),
    )))
}

async fn load_album(store: &SqlitePinStore, pin_id: PinId) -> anyhow::Result<Vec<Arc<Photo>>> {
    Ok(store
        .list_photos(pin_id)
        .await?
        .into_iter()
        .map(Arc::new)
        .collect())
}

async fn run_pin(store: Arc<SqlitePinStore>, command: PinCommand) -> anyhow::Result<()> {
    match command {
        PinCommand::Add(args) => {
            let coordinate = parse_coordinate(args)?;
            let pin = store.create_pin(coordinate).await?;
            println!("Dropped pin {} at {}", pin.id, pin.coordinate);
            println!("Run `pin-album album show {}` to load its photos.", pin.id);
        }
        PinCommand::List => {
            let pins = store.list_pins().await?;
            if pins.is_empty() {
                println!("No pins yet. Drop one with `pin-album pin add --lat <LAT> --lon <LON>`.");
                return Ok(());
            }
            println!("{:>6}  {:<22}  {:>6}  Created", "Pin", "Coordinate", "Photos");
            for pin in pins {
                let photos = store.count_photos(pin.id).await?;
                println!(
                    "{:>6}  {:<22}  {:>6}  {}",
                    pin.id,
                    pin.coordinate.to_string(),
                    photos,
                    pin.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        PinCommand::Delete { pin_id } => {
            let pin_id = PinId(pin_id);
            let photos = store.count_photos(pin_id).await?;
            store.delete_pin(pin_id).await?;
            println!("Deleted pin {} and {} photo(s)", pin_id, photos);
        }
    }
    Ok(())
}

/// Open a pin's album: start (or skip) a fetch cycle and render its progress
/// from the store's change events until the cycle finishes.
///
/// On shutdown the view detaches but the cycle is still awaited so that
/// photos already downloading get saved.
async fn run_album(
    store: Arc<SqlitePinStore>,
    config: &Config,
    command: AlbumCommand,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    let api_key = config.api_key.clone().ok_or_else(|| {
        anyhow::anyhow!("A Flickr API key is required: pass --api-key or set FLICKR_API_KEY")
    })?;

    let (pin_id, refresh) = match command {
        AlbumCommand::Show { pin_id } => (PinId(pin_id), false),
        AlbumCommand::Refresh { pin_id } => (PinId(pin_id), true),
    };
    let pin = store
        .get_pin(pin_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Pin {} not found", pin_id))?;

    let engine = build_engine(store.clone(), config, api_key)?;

    // Subscribe before loading so no change between the two is missed.
    let mut album = store.subscribe_photos(pin.id);
    let mut photos = load_album(&store, pin.id).await?;
    let mut fetching = engine.watch_fetching();
    let mut handle = if refresh {
        engine.spawn_refresh(pin.clone())
    } else {
        engine.spawn_ensure_photos(pin.clone())
    };

    let pb = create_progress_bar(config.no_progress_bar, config.per_page as u64);
    let mut observing = true;

    let outcome = loop {
        // Drain pending album events before acting on the cycle's result.
        tokio::select! {
            biased;
            change = album.recv(), if observing => match change {
                Some(change) => {
                    if let ChangeEvent::Inserted { entity, .. } = &change {
                        pb.set_message(format!("photo {} ({} KiB)", entity.id, entity.image.len() / 1024));
                        pb.inc(1);
                    }
                    if !change.apply_to(&mut photos) {
                        pb.suspend(|| tracing::info!(pin_id = %album.pin_id(), "Album reset, reloading"));
                        photos = load_album(&store, album.pin_id()).await?;
                    }
                }
                None => observing = false,
            },
            Ok(()) = fetching.changed(), if observing => {
                if engine.trigger_enabled(pin.id) {
                    pb.set_message("new collection available");
                } else {
                    pb.set_message("fetching");
                }
            },
            _ = shutdown_token.cancelled(), if observing => {
                pb.suspend(|| tracing::info!("Detaching album view"));
                observing = false;
            }
            result = &mut handle => break result??,
        }
    };
    pb.finish_and_clear();

    match outcome {
        SyncOutcome::Cached { photos } => {
            println!("Pin {}: {} cached photo(s)", pin.id, photos);
        }
        SyncOutcome::Fetched(report) if report.search_failed => {
            println!("Pin {}: photo search failed, album is empty", pin.id);
        }
        SyncOutcome::Fetched(report) => {
            println!(
                "Pin {}: saved {} of {} photo(s) from page {} ({} failed)",
                pin.id, report.saved, report.references, report.page, report.failed
            );
        }
        SyncOutcome::AlreadyFetching => {
            println!("Pin {}: a fetch is already in progress", pin.id);
        }
    }

    if !shutdown_token.is_cancelled() {
        for photo in &photos {
            println!(
                "  photo {:>6}  {:>8} bytes  {}",
                photo.id,
                photo.image.len(),
                photo.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn run_region(cache: RegionCache, command: RegionCommand) -> anyhow::Result<()> {
    match command {
        RegionCommand::Show => {
            let region = cache.load().await;
            println!(
                "Center ({:.4}, {:.4}), span {:.3}° x {:.3}°",
                region.latitude, region.longitude, region.lat_span, region.lon_span
            );
        }
        RegionCommand::Set { center, span } => {
            let coordinate = parse_coordinate(center)?;
            if !(span.is_finite() && span > 0.0 && span <= 180.0) {
                anyhow::bail!("--span must be within (0, 180] degrees");
            }
            let region = MapRegion {
                latitude: coordinate.latitude,
                longitude: coordinate.longitude,
                lat_span: span,
                lon_span: span,
            };
            cache.save(&region).await?;
            println!("Saved map region centered on {}", coordinate);
        }
    }
    Ok(())
}

async fn run_status(store: Arc<SqlitePinStore>, cache: RegionCache) -> anyhow::Result<()> {
    let summary = store.summary().await?;
    let region = cache.load().await;

    println!("Album database: {}", store.path().display());
    println!();
    println!("Pins:   {}", summary.pins);
    println!("Photos: {}", summary.photos);
    println!("Images: {:.1} MiB", summary.image_bytes as f64 / (1024.0 * 1024.0));
    if let Some(newest) = summary.newest_pin {
        println!("Newest pin: {}", newest.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    println!(
        "Map region: ({:.4}, {:.4}) span {:.3}° ({})",
        region.latitude,
        region.longitude,
        region.lat_span,
        cache.path().display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(&cli)?;
    tracing::debug!(?config, "Starting pin-album");

    let store = open_store(&config).await?;
    let regions = RegionCache::new(&config.data_dir);

    match cli.command {
        Command::Pin(command) => run_pin(store, command).await,
        Command::Album(command) => {
            let shutdown_token = shutdown::install_signal_handler()?;
            run_album(store, &config, command, shutdown_token).await
        }
        Command::Photo(PhotoCommand::Delete { photo_id }) => {
            // Deleting never reaches the network, so no key is needed.
            let engine = build_engine(store, &config, config.api_key.clone().unwrap_or_default())?;
            engine.delete_photo(PhotoId(photo_id)).await?;
            println!("Deleted photo {}", photo_id);
            Ok(())
        }
        Command::Region(command) => run_region(regions, command).await,
        Command::Status => run_status(store, regions).await,
    }
}
