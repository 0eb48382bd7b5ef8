//! Database access layer

pub mod lyrics;
pub mod playlists;
pub mod results;
pub mod settings;
pub mod tracks;
