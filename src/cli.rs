use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pin-pix", about = "Sync Flickr photos for places you pin")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pin a new location
    #[command(allow_negative_numbers = true)]
    Add {
        /// Latitude in decimal degrees
        latitude: f64,
        /// Longitude in decimal degrees
        longitude: f64,
    },

    /// List pinned locations
    List,

    /// Show the photo set of a location, fetching it on first use
    Photos { location: i64 },

    /// Replace a location's photos with a new random page
    Refresh { location: i64 },

    /// Delete photos from a location; they will not come back on refresh
    Delete {
        location: i64,
        #[arg(required = true)]
        photos: Vec<String>,
    },

    /// Remove a location together with its photos
    Remove { location: i64 },

    /// Download and cache every image of a location
    Download { location: i64 },
}
