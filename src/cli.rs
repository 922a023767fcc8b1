use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "pin-album",
    version,
    about = "Drop map pins and keep a cached album of nearby photos for each"
)]
pub struct Cli {
    /// Directory holding the album database and map region
    #[arg(long, global = true, default_value = "~/.pin-album")]
    pub data_dir: String,

    /// Flickr API key.
    /// Prefer the FLICKR_API_KEY environment variable over the flag.
    #[arg(long, global = true, env = "FLICKR_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Number of concurrent image downloads per album
    #[arg(long, global = true, default_value_t = 4)]
    pub concurrency: u16,

    /// Highest result page a fetch may pick from
    #[arg(long, global = true, default_value_t = 10)]
    pub max_page: u32,

    /// Photos requested per search page
    #[arg(long, global = true, default_value_t = 20)]
    pub per_page: u32,

    /// Search radius in kilometres
    #[arg(long, global = true, default_value_t = 10)]
    pub radius: u32,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, list, or delete pins
    #[command(subcommand)]
    Pin(PinCommand),

    /// Show or refresh a pin's photo album
    #[command(subcommand)]
    Album(AlbumCommand),

    /// Delete a single photo
    #[command(subcommand)]
    Photo(PhotoCommand),

    /// Show or update the saved map region
    #[command(subcommand)]
    Region(RegionCommand),

    /// Summarize the local cache
    Status,
}

#[derive(Subcommand, Debug)]
pub enum PinCommand {
    /// Drop a pin at a coordinate
    Add(CoordinateArgs),
    /// List pins, newest first
    List,
    /// Delete a pin and all of its photos
    Delete { pin_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum AlbumCommand {
    /// Open a pin's album, fetching photos if none are cached
    Show { pin_id: i64 },
    /// Discard the album and fetch a new collection
    Refresh { pin_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum PhotoCommand {
    Delete { photo_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum RegionCommand {
    Show,
    Set {
        #[command(flatten)]
        center: CoordinateArgs,
        /// Latitude and longitude span in degrees
        #[arg(long, default_value_t = 0.3)]
        span: f64,
    },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct CoordinateArgs {
    /// Latitude in decimal degrees
    #[arg(long, allow_negative_numbers = true)]
    pub lat: f64,
    /// Longitude in decimal degrees
    #[arg(long, allow_negative_numbers = true)]
    pub lon: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pin_add_negative_coordinates() {
        let cli =
            Cli::try_parse_from(["pin-album", "pin", "add", "--lat", "-33.86", "--lon", "151.2"])
                .unwrap();
        match cli.command {
            Command::Pin(PinCommand::Add(coord)) => {
                assert_eq!(coord.lat, -33.86);
                assert_eq!(coord.lon, 151.2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pin-album",
            "album",
            "refresh",
            "7",
            "--concurrency",
            "8",
            "--no-progress-bar",
        ])
        .unwrap();
        assert_eq!(cli.concurrency, 8);
        assert!(cli.no_progress_bar);
        assert!(matches!(
            cli.command,
            Command::Album(AlbumCommand::Refresh { pin_id: 7 })
        ));
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["pin-album", "status"]).unwrap();
        assert_eq!(cli.data_dir, "~/.pin-album");
        assert_eq!(cli.max_page, 10);
        assert_eq!(cli.per_page, 20);
        assert_eq!(cli.radius, 10);
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn test_region_set_span() {
        let cli = Cli::try_parse_from([
            "pin-album", "region", "set", "--lat", "1", "--lon", "2", "--span", "0.5",
        ])
        .unwrap();
        match cli.command {
            Command::Region(RegionCommand::Set { center, span }) => {
                assert_eq!(center.lat, 1.0);
                assert_eq!(span, 0.5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["pin-album"]).is_err());
    }
}
