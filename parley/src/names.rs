//! Default session names.
//!
//! Sessions created without a name get something short and memorable like
//! "Quiet Heron" so they can be told apart in a list.

use rand::prelude::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "Amber", "Brisk", "Calm", "Dusty", "Eager", "Fuzzy", "Gentle", "Hasty",
    "Idle", "Jolly", "Keen", "Lucky", "Mellow", "Nimble", "Odd", "Plucky",
    "Quiet", "Rusty", "Sly", "Tidy", "Upbeat", "Vivid", "Wry", "Zesty",
];

const CREATURES: &[&str] = &[
    "Badger", "Bison", "Crane", "Dingo", "Egret", "Ferret", "Gecko", "Heron",
    "Ibex", "Jackal", "Koala", "Lemur", "Marmot", "Newt", "Otter", "Puffin",
    "Quail", "Raven", "Stoat", "Tapir", "Urchin", "Vole", "Walrus", "Yak",
];

/// Generate a random session name.
pub fn generate_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"Nameless");
    let creature = CREATURES.choose(&mut rng).unwrap_or(&"Session");
    format!("{adjective} {creature}")
}
