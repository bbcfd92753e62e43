//! Language code normalization and stream-title heuristics.

use regex::Regex;
use std::sync::OnceLock;

/// ISO-639-1 to ISO-639-2/T pairs covering the languages LibreTranslate
/// deployments commonly serve.
const ISO639: &[(&str, &str)] = &[
    ("aa", "aar"),
    ("ab", "abk"),
    ("af", "afr"),
    ("am", "amh"),
    ("ar", "ara"),
    ("az", "aze"),
    ("be", "bel"),
    ("bg", "bul"),
    ("bn", "ben"),
    ("bs", "bos"),
    ("ca", "cat"),
    ("cs", "ces"),
    ("cy", "cym"),
    ("da", "dan"),
    ("de", "deu"),
    ("dv", "div"),
    ("dz", "dzo"),
    ("el", "ell"),
    ("en", "eng"),
    ("es", "spa"),
    ("et", "est"),
    ("eu", "eus"),
    ("fa", "fas"),
    ("fi", "fin"),
    ("fr", "fra"),
    ("ga", "gle"),
    ("he", "heb"),
    ("hi", "hin"),
    ("hr", "hrv"),
    ("hu", "hun"),
    ("hy", "hye"),
    ("id", "ind"),
    ("is", "isl"),
    ("it", "ita"),
    ("ja", "jpn"),
    ("ka", "kat"),
    ("kk", "kaz"),
    ("ko", "kor"),
    ("la", "lat"),
    ("lb", "ltz"),
    ("lt", "lit"),
    ("lv", "lav"),
    ("mk", "mkd"),
    ("mn", "mon"),
    ("ms", "msa"),
    ("nb", "nob"),
    ("nl", "nld"),
    ("pl", "pol"),
    ("pt", "por"),
    ("ro", "ron"),
    ("ru", "rus"),
    ("sk", "slk"),
    ("sl", "slv"),
    ("sq", "sqi"),
    ("sr", "srp"),
    ("sv", "swe"),
    ("th", "tha"),
    ("tr", "tur"),
    ("uk", "ukr"),
    ("ur", "urd"),
    ("vi", "vie"),
    ("zh", "zho"),
];

/// ISO-639-2/B codes still common in MKV tags, mapped to ISO-639-1.
const ISO639_2B: &[(&str, &str)] = &[
    ("alb", "sq"),
    ("arm", "hy"),
    ("baq", "eu"),
    ("chi", "zh"),
    ("cze", "cs"),
    ("dut", "nl"),
    ("fre", "fr"),
    ("geo", "ka"),
    ("ger", "de"),
    ("gre", "el"),
    ("ice", "is"),
    ("mac", "mk"),
    ("may", "ms"),
    ("per", "fa"),
    ("rum", "ro"),
    ("slo", "sk"),
    ("wel", "cy"),
];

fn iso2_for(iso1: &str) -> Option<&'static str> {
    ISO639
        .binary_search_by_key(&iso1, |&(one, _)| one)
        .ok()
        .map(|idx| ISO639[idx].1)
}

fn iso1_for(iso2: &str) -> Option<&'static str> {
    if let Some((one, _)) = ISO639.iter().find(|(_, two)| *two == iso2) {
        return Some(one);
    }
    ISO639_2B
        .iter()
        .find(|(b, _)| *b == iso2)
        .map(|(_, one)| *one)
}

/// Returns an mkvpropedit-friendly ISO-639-2 code, passing unknown codes
/// through lowercased.
pub fn normalize_language_code(code: Option<&str>) -> Option<String> {
    let normalized = code?.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if normalized.len() == 2 {
        if let Some(iso2) = iso2_for(&normalized) {
            return Some(iso2.to_string());
        }
    }
    Some(normalized)
}

/// Returns the ISO-639-1 form of a language code, or `None` when the code
/// cannot be mapped.
pub fn normalize_language_code_iso1(code: Option<&str>) -> Option<String> {
    let normalized = code?.trim().to_lowercase();
    match normalized.len() {
        2 if normalized.chars().all(|c| c.is_ascii_alphabetic()) => Some(normalized),
        3 => iso1_for(&normalized).map(str::to_string),
        _ => None,
    }
}

/// Whether a subtitle codec carries text the translator can consume.
pub fn is_text_subtitle_codec(codec: &str) -> bool {
    matches!(
        codec.to_lowercase().as_str(),
        "subrip" | "srt" | "ass" | "ssa" | "webvtt" | "text" | "mov_text"
    )
}

/// English language names that show up in track titles like "Spanish" or
/// "Spanish (Forced)".
const TITLE_LANGUAGES: &[(&str, &str)] = &[
    ("arabic", "ar"),
    ("bosnian", "bs"),
    ("bulgarian", "bg"),
    ("chinese", "zh"),
    ("croatian", "hr"),
    ("czech", "cs"),
    ("danish", "da"),
    ("dutch", "nl"),
    ("english", "en"),
    ("finnish", "fi"),
    ("french", "fr"),
    ("german", "de"),
    ("greek", "el"),
    ("hebrew", "he"),
    ("hindi", "hi"),
    ("hungarian", "hu"),
    ("indonesian", "id"),
    ("italian", "it"),
    ("japanese", "ja"),
    ("korean", "ko"),
    ("norwegian", "nb"),
    ("polish", "pl"),
    ("portuguese", "pt"),
    ("romanian", "ro"),
    ("russian", "ru"),
    ("serbian", "sr"),
    ("slovak", "sk"),
    ("slovenian", "sl"),
    ("spanish", "es"),
    ("swedish", "sv"),
    ("thai", "th"),
    ("turkish", "tr"),
    ("ukrainian", "uk"),
    ("vietnamese", "vi"),
];

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-z]+").unwrap())
}

/// Extracts an ISO-639-1 hint from a stream title such as "Spanish track".
pub fn language_hint_from_title(title: Option<&str>) -> Option<String> {
    let title = title?.to_lowercase();
    for word in word_pattern().find_iter(&title) {
        if let Some((_, code)) = TITLE_LANGUAGES
            .iter()
            .find(|(name, _)| *name == word.as_str())
        {
            return Some(code.to_string());
        }
    }
    None
}

/// Whether a stream title marks the track as SDH / hard-of-hearing.
pub fn title_indicates_hearing_impaired(title: Option<&str>) -> bool {
    let Some(title) = title else {
        return false;
    };
    let lowered = title.to_lowercase();
    if lowered.contains("hearing") {
        return true;
    }
    word_pattern()
        .find_iter(&lowered)
        .any(|word| matches!(word.as_str(), "sdh" | "hoh" | "cc"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_table_is_sorted_for_binary_search() {
        for pair in ISO639.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{:?} out of order", pair);
        }
    }

    #[test]
    fn normalize_maps_two_letter_codes() {
        assert_eq!(normalize_language_code(Some("en")).as_deref(), Some("eng"));
        assert_eq!(normalize_language_code(Some(" NL ")).as_deref(), Some("nld"));
        assert_eq!(normalize_language_code(Some("spa")).as_deref(), Some("spa"));
        assert_eq!(normalize_language_code(Some("xx")).as_deref(), Some("xx"));
        assert_eq!(normalize_language_code(Some("")), None);
        assert_eq!(normalize_language_code(None), None);
    }

    #[test]
    fn iso1_handles_bibliographic_codes() {
        assert_eq!(normalize_language_code_iso1(Some("deu")).as_deref(), Some("de"));
        assert_eq!(normalize_language_code_iso1(Some("ger")).as_deref(), Some("de"));
        assert_eq!(normalize_language_code_iso1(Some("dut")).as_deref(), Some("nl"));
        assert_eq!(normalize_language_code_iso1(Some("es")).as_deref(), Some("es"));
        assert_eq!(normalize_language_code_iso1(Some("qqq")), None);
        assert_eq!(normalize_language_code_iso1(Some("und")), None);
    }

    #[test]
    fn text_codecs() {
        assert!(is_text_subtitle_codec("subrip"));
        assert!(is_text_subtitle_codec("ASS"));
        assert!(!is_text_subtitle_codec("hdmv_pgs_subtitle"));
        assert!(!is_text_subtitle_codec("dvd_subtitle"));
    }

    #[test]
    fn title_hints() {
        assert_eq!(
            language_hint_from_title(Some("Spanish track")).as_deref(),
            Some("es")
        );
        assert_eq!(
            language_hint_from_title(Some("FRENCH (Forced)")).as_deref(),
            Some("fr")
        );
        assert_eq!(language_hint_from_title(Some("Director's commentary")), None);
        assert_eq!(language_hint_from_title(None), None);
    }

    #[test]
    fn hearing_impaired_titles() {
        assert!(title_indicates_hearing_impaired(Some("English (SDH)")));
        assert!(title_indicates_hearing_impaired(Some("Hard of Hearing")));
        assert!(title_indicates_hearing_impaired(Some("English [CC]")));
        assert!(!title_indicates_hearing_impaired(Some("English")));
        assert!(!title_indicates_hearing_impaired(None));
    }
}
