use anyhow::{Context, Result};
use phonenumber::{country, Mode};

/// The stored representation of a caller that withheld their number.
pub const ANONYMOUS: &str = "anonymous";

/// Normalizes a caller number to international format using `region` as
/// the default parsing region. The literal "Anonymous" (any casing) maps
/// to the stored [`ANONYMOUS`] literal.
pub fn normalize_caller(raw: &str, region: country::Id) -> Result<String> {
    if raw.eq_ignore_ascii_case(ANONYMOUS) {
        return Ok(ANONYMOUS.to_string());
    }

    let parsed = phonenumber::parse(Some(region), raw)
        .with_context(|| format!("failed to parse caller phone number {raw:?}"))?;

    Ok(parsed.format().mode(Mode::International).to_string())
}
