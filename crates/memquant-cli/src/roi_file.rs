//! ROI file reading and writing.
//!
//! Two input formats are accepted:
//!
//! - JSON: `[[x, y], ...]` for one ROI shared by every frame, or
//!   `[[[x, y], ...], ...]` for one ROI per frame.
//! - Plain text: one `x y` (or `x,y`) pair per line. Blank lines and
//!   lines starting with `#` are skipped.
//!
//! Refined ROIs are written back as JSON in the same shape.

use memquant_pipeline::Roi;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum RoiJson {
    Single(Vec<[f64; 2]>),
    Many(Vec<Vec<[f64; 2]>>),
}

fn roi_from_pairs(pairs: &[[f64; 2]]) -> Roi {
    Roi::from_xy(&pairs.iter().map(|&[x, y]| (x, y)).collect::<Vec<_>>())
}

/// Parse ROI file contents into one or more ROIs.
pub fn parse(text: &str) -> Result<Vec<Roi>, String> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let parsed: RoiJson =
            serde_json::from_str(trimmed).map_err(|e| format!("invalid ROI JSON: {e}"))?;
        return Ok(match parsed {
            RoiJson::Single(pairs) => vec![roi_from_pairs(&pairs)],
            RoiJson::Many(rois) => rois.iter().map(|p| roi_from_pairs(p)).collect(),
        });
    }

    let mut coords = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        let &[x, y] = fields.as_slice() else {
            return Err(format!(
                "line {}: expected two coordinates, found {}",
                lineno + 1,
                fields.len()
            ));
        };
        let coord = |s: &str| {
            s.parse::<f64>()
                .map_err(|e| format!("line {}: bad coordinate {s:?}: {e}", lineno + 1))
        };
        coords.push((coord(x)?, coord(y)?));
    }
    if coords.is_empty() {
        return Err("ROI file contains no points".to_owned());
    }
    Ok(vec![Roi::from_xy(&coords)])
}

/// Serialize ROIs as `[[x, y], ...]` (one ROI) or a list of those.
pub fn to_json(rois: &[Roi]) -> Result<String, serde_json::Error> {
    let pairs: Vec<Vec<[f64; 2]>> = rois
        .iter()
        .map(|roi| roi.points().iter().map(|p| [p.x, p.y]).collect())
        .collect();
    match pairs.as_slice() {
        [single] => serde_json::to_string_pretty(single),
        _ => serde_json::to_string_pretty(&pairs),
    }
}
