use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use unicode_normalization::UnicodeNormalization;

/// Map an original folder name to its key-safe form.
///
/// Unicode NFC first, then percent-encode every character that is not
/// ASCII-alphanumeric, then fold `%20` (space) and `%2F` (slash) to `_`.
/// Mapper, Zipper, Unzipper and Fixup must all go through this one function:
/// any divergence silently breaks resume because progress documents and
/// archive keys would stop lining up across components.
pub fn sanitize_name(name: &str) -> String {
    let nfc: String = name.nfc().collect();
    let encoded = utf8_percent_encode(&nfc, NON_ALPHANUMERIC).to_string();
    encoded.replace("%20", "_").replace("%2F", "_")
}
