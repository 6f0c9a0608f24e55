//! Glyph handling: the `fonts://` resolver contract (fontstack splitting
//! and range-file assembly from the fonts directory, validated against the
//! set of stacks discovered at startup) and the text face used to stamp
//! watermark and attribution strips.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ab_glyph::FontArc;
use tracing::warn;

use crate::error::ServeError;

/// Font directory access. The `existing` set is populated once at startup
/// and read-only afterwards.
pub struct GlyphStore {
    fonts_dir: PathBuf,
    existing: HashSet<String>,
}

impl GlyphStore {
    /// Scan the fonts directory for available stacks (one subdirectory per
    /// font, holding `<start>-<end>.pbf` range files).
    pub fn scan(fonts_dir: &Path) -> Self {
        let mut existing = HashSet::new();
        if let Ok(entries) = std::fs::read_dir(fonts_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        existing.insert(name.to_string());
                    }
                }
            }
        }
        Self {
            fonts_dir: fonts_dir.to_path_buf(),
            existing,
        }
    }

    pub fn existing(&self) -> &HashSet<String> {
        &self.existing
    }

    /// Combine the glyph range for a comma-separated fontstack. Serialized
    /// glyph protobufs merge by concatenation; the renderer takes the first
    /// occurrence of a glyph id, so fonts earlier in the stack win.
    pub async fn assemble(
        &self,
        fontstack: &str,
        range: &str,
        allowed: Option<&HashSet<String>>,
    ) -> Result<Vec<u8>, ServeError> {
        if !is_valid_range(range) {
            return Err(ServeError::bad_request(format!("invalid glyph range '{range}'")));
        }

        let mut combined = Vec::new();
        let mut served = 0usize;
        for font in fontstack.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            if font.contains('/') || font.contains("..") {
                continue;
            }
            if !self.existing.contains(font) {
                continue;
            }
            if let Some(allowed) = allowed {
                if !allowed.contains(font) {
                    continue;
                }
            }
            let path = self.fonts_dir.join(font).join(format!("{range}.pbf"));
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    combined.extend_from_slice(&bytes);
                    served += 1;
                }
                Err(e) => {
                    warn!("glyph range {} missing for {}: {}", range, font, e);
                }
            }
        }

        if served == 0 {
            return Err(ServeError::not_found(format!(
                "no glyphs for fontstack '{fontstack}'"
            )));
        }
        Ok(combined)
    }
}

fn is_valid_range(range: &str) -> bool {
    match range.split_once('-') {
        Some((start, end)) => {
            !start.is_empty()
                && !end.is_empty()
                && start.bytes().all(|b| b.is_ascii_digit())
                && end.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Face used for the watermark and attribution text. Loads the configured
/// TTF when given, otherwise asks the system font database for a
/// sans-serif face. `None` disables text overlays.
pub fn load_text_face(configured: Option<&Path>) -> Option<FontArc> {
    if let Some(path) = configured {
        match std::fs::read(path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => return Some(font),
                Err(e) => warn!("cannot parse font {}: {}", path.display(), e),
            },
            Err(e) => warn!("cannot read font {}: {}", path.display(), e),
        }
    }

    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    let query = fontdb::Query {
        families: &[fontdb::Family::SansSerif],
        ..Default::default()
    };
    let id = db.query(&query)?;
    let font = db.with_face_data(id, |data, _index| FontArc::try_from_vec(data.to_vec()).ok())??;
    Some(font)
}
