//! Display-name color accessibility against the fixed chat background.

/// Background every chat message is drawn on.
pub const CHAT_BASE_BG: &str = "#131314";

/// Substitute for user colors that fail the contrast floor.
pub const FALLBACK_TEXT_COLOR: &str = "#e5e7eb";

/// WCAG AA minimum contrast ratio for normal text.
const MIN_CONTRAST_RATIO: f64 = 4.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

pub fn hex_to_rgb(hex: &str) -> Option<Rgb> {
    let normalized = hex.trim().trim_start_matches('#');
    let expanded: String = match normalized.len() {
        3 => normalized.chars().flat_map(|c| [c, c]).collect(),
        6 => normalized.to_string(),
        _ => return None,
    };
    let value = u32::from_str_radix(&expanded, 16).ok()?;
    Some(Rgb {
        r: ((value >> 16) & 0xff) as u8,
        g: ((value >> 8) & 0xff) as u8,
        b: (value & 0xff) as u8,
    })
}

pub fn relative_luminance(rgb: Rgb) -> f64 {
    let channel = |v: u8| {
        let v = f64::from(v) / 255.0;
        if v <= 0.03928 {
            v / 12.92
        } else {
            ((v + 0.055) / 1.055).powf(2.4)
        }
    };
    0.2126 * channel(rgb.r) + 0.7152 * channel(rgb.g) + 0.0722 * channel(rgb.b)
}

pub fn contrast_ratio(hex_a: &str, hex_b: &str) -> f64 {
    let (Some(rgb_a), Some(rgb_b)) = (hex_to_rgb(hex_a), hex_to_rgb(hex_b)) else {
        // Unparseable input: report maximum contrast so callers keep it as-is.
        return 21.0;
    };
    let l1 = relative_luminance(rgb_a) + 0.05;
    let l2 = relative_luminance(rgb_b) + 0.05;
    if l1 > l2 {
        l1 / l2
    } else {
        l2 / l1
    }
}

/// Returns the user color when it clears the AA floor against the chat
/// background, the fallback otherwise. Missing or malformed colors also
/// map to the fallback.
pub fn ensure_accessible_text_color(user_hex: Option<&str>) -> String {
    let Some(user_hex) = user_hex else {
        return FALLBACK_TEXT_COLOR.to_string();
    };
    if !user_hex.starts_with('#') || hex_to_rgb(user_hex).is_none() {
        return FALLBACK_TEXT_COLOR.to_string();
    }
    if contrast_ratio(user_hex, CHAT_BASE_BG) < MIN_CONTRAST_RATIO {
        FALLBACK_TEXT_COLOR.to_string()
    } else {
        user_hex.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_hex() {
        assert_eq!(
            hex_to_rgb("#fff"),
            Some(Rgb {
                r: 255,
                g: 255,
                b: 255
            })
        );
        assert_eq!(hex_to_rgb("#131314"), Some(Rgb { r: 19, g: 19, b: 20 }));
        assert_eq!(hex_to_rgb("not-a-color"), None);
    }

    #[test]
    fn black_on_dark_background_substitutes_fallback() {
        assert_eq!(
            ensure_accessible_text_color(Some("#000000")),
            FALLBACK_TEXT_COLOR
        );
    }

    #[test]
    fn bright_colors_pass_through() {
        assert_eq!(ensure_accessible_text_color(Some("#ffffff")), "#ffffff");
        assert_eq!(ensure_accessible_text_color(Some("#e5e7eb")), "#e5e7eb");
    }

    #[test]
    fn missing_or_malformed_color_falls_back() {
        assert_eq!(ensure_accessible_text_color(None), FALLBACK_TEXT_COLOR);
        assert_eq!(
            ensure_accessible_text_color(Some("red")),
            FALLBACK_TEXT_COLOR
        );
    }

    #[test]
    fn contrast_ratio_is_symmetric() {
        let a = contrast_ratio("#131314", "#ffffff");
        let b = contrast_ratio("#ffffff", "#131314");
        assert!((a - b).abs() < 1e-9);
        assert!(a > 4.5);
    }
}
