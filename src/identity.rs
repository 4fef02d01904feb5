//! Unit name generation.
//!
//! A unit name looks like `jr-<name>-<YYYYMMDD-HHMMSS>-<16 random chars>.service`.
//! The random part makes collisions unlikely, not impossible; the registry's
//! unique constraint on `unit` is what actually rejects a duplicate.

use rand::Rng;
use time::OffsetDateTime;

pub const UNIT_PREFIX: &str = "jr-";
pub const UNIT_SUFFIX: &str = ".service";

/// Width of the random component, in Crockford base32 characters.
const RANDOM_WIDTH: usize = 16;
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a fresh unit name for a job called `name`.
pub fn generate(name: &str) -> String {
    generate_at(name, OffsetDateTime::now_utc(), &mut rand::thread_rng())
}

pub(crate) fn generate_at<R: Rng + ?Sized>(name: &str, now: OffsetDateTime, rng: &mut R) -> String {
    format!(
        "{UNIT_PREFIX}{}-{}-{}{UNIT_SUFFIX}",
        sanitize(name),
        compact_timestamp(now),
        random_component(rng)
    )
}

/// Map `name` onto the characters systemd accepts in a unit name.
///
/// ASCII letters are lower-cased, ASCII digits and `.`, `-`, `_` are kept,
/// everything else becomes `_` one character at a time.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

fn compact_timestamp(now: OffsetDateTime) -> String {
    let now = now.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn random_component<R: Rng + ?Sized>(rng: &mut R) -> String {
    let bits: u128 = rng.gen();
    (0..RANDOM_WIDTH)
        .map(|i| CROCKFORD[((bits >> (5 * i)) & 0x1f) as usize] as char)
        .collect()
}
