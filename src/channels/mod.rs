pub mod discord;
pub mod formatting;

pub use discord::{DiscordApi, DiscordHandler};
