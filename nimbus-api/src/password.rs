//! Memorable password generation for new VMs.
//!
//! Adjective, noun and verb plus a two-digit integer, all drawn from the
//! system CSPRNG. Returned to the caller exactly once; the persisted
//! record only ever holds the wallet-encrypted ciphertext.

use rand::rngs::OsRng;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "clever", "coral", "crisp", "eager", "fuzzy", "gentle", "glad",
    "golden", "grand", "happy", "jolly", "keen", "lively", "lucky", "mellow", "noble", "polar",
    "proud", "quick", "quiet", "rapid", "royal", "rustic", "silent", "smooth", "solar", "spry",
    "steady", "sturdy", "sunny", "swift", "tidy", "vivid", "warm", "wise", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "cedar", "comet", "condor", "coral", "crane", "delta", "ember",
    "falcon", "fjord", "gecko", "glacier", "harbor", "heron", "island", "jaguar", "lagoon",
    "lantern", "lynx", "maple", "meadow", "meteor", "nebula", "orchid", "osprey", "otter",
    "panther", "pebble", "prairie", "raven", "reef", "river", "sparrow", "summit", "thicket",
    "tundra", "walnut", "willow",
];

const VERBS: &[&str] = &[
    "climbs", "dances", "darts", "dives", "drifts", "flies", "flows", "gallops", "glides",
    "hops", "hums", "jumps", "leaps", "marches", "prowls", "races", "rises", "roams", "rolls",
    "runs", "sails", "sings", "soars", "spins", "sprints", "swims", "travels", "trots",
    "wanders", "waves",
];

/// Generate a memorable password like `brisk-falcon-glides-47`.
pub fn generate_memorable_password() -> String {
    let mut rng = OsRng;
    format!(
        "{}-{}-{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        NOUNS[rng.gen_range(0..NOUNS.len())],
        VERBS[rng.gen_range(0..VERBS.len())],
        rng.gen_range(10..100)
    )
}
