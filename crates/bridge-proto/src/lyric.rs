//! Lyric text parsers.
//!
//! Two timed formats are understood:
//!
//! - **LRC**, line-synced: `[mm:ss.xx]text`.  Each line becomes a single
//!   synthetic word spanning the whole line.
//! - **YRC**, word-synced: `[lineStart,duration](wordStart,durationCs,len)text...`.
//!
//! TTML documents are never parsed here; they go to the display verbatim.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::protocol::{LyricLine, LyricWord};

/// Duration given to the final LRC line, which has no successor to end it.
pub const LAST_LINE_MS: u64 = 5000;

/// Max start-time distance for a translated/romanized line to attach to a
/// primary line.
pub const COMPANION_TOLERANCE_MS: u64 = 100;

fn lrc_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(\d{1,3}):(\d{2})\.(\d{2,3})\]").expect("LRC time tag pattern is valid")
    })
}

fn yrc_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[(\d+),(\d+)\]").expect("YRC line pattern is valid"))
}

fn yrc_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\((\d+),(\d+),(\d+)\)").expect("YRC word pattern is valid")
    })
}

fn capture_u64(caps: &Captures<'_>, idx: usize) -> Option<u64> {
    caps.get(idx)?.as_str().parse().ok()
}

impl LyricLine {
    /// A line holding one word that spans the whole line.
    pub fn single_word(start_time: u64, end_time: u64, text: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            words: vec![LyricWord {
                start_time,
                end_time,
                word: text.into(),
            }],
            ..Self::default()
        }
    }

    /// Concatenated text of every word.
    pub fn text(&self) -> String {
        self.words.iter().map(|w| w.word.as_str()).collect()
    }
}

/// Start time in ms of one `[mm:ss.xx]` tag.
fn lrc_tag_ms(caps: &Captures<'_>) -> Option<u64> {
    let minutes = capture_u64(caps, 1)?;
    let seconds = capture_u64(caps, 2)?;
    let frac = caps.get(3)?.as_str();
    let mut millis: u64 = frac.parse().ok()?;
    // two digits are hundredths
    if frac.len() == 2 {
        millis *= 10;
    }
    Some((minutes * 60 + seconds) * 1000 + millis)
}

/// Parse LRC text.  Lines without a leading time tag or without text are
/// dropped.  A line carrying several tags (`[00:01.00][00:31.00]chorus`)
/// yields one entry per tag.
pub fn parse_lrc(text: &str) -> Vec<LyricLine> {
    let mut stamped: Vec<(u64, &str)> = Vec::new();

    for raw in text.lines() {
        let mut rest = raw.trim_start();
        let mut starts = Vec::new();

        while let Some(caps) = lrc_tag_re().captures(rest) {
            let (Some(whole), Some(start)) = (caps.get(0), lrc_tag_ms(&caps)) else {
                break;
            };
            starts.push(start);
            rest = &rest[whole.end()..];
        }

        let content = rest.trim();
        if content.is_empty() {
            continue;
        }
        stamped.extend(starts.into_iter().map(|start| (start, content)));
    }

    stamped.sort_by_key(|(start, _)| *start);

    let mut lines = Vec::with_capacity(stamped.len());
    for (i, (start, content)) in stamped.iter().enumerate() {
        let end = stamped
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(start + LAST_LINE_MS);
        lines.push(LyricLine::single_word(*start, end, *content));
    }
    lines
}

/// Parse YRC text.  Metadata lines (JSON objects) and lines with no word
/// groups are dropped.
pub fn parse_yrc(text: &str) -> Vec<LyricLine> {
    let mut lines = Vec::new();

    for raw in text.lines() {
        let raw = raw.trim();
        let Some(header) = yrc_line_re().captures(raw) else {
            continue;
        };
        let (Some(whole), Some(start), Some(duration)) =
            (header.get(0), capture_u64(&header, 1), capture_u64(&header, 2))
        else {
            continue;
        };

        // a word's text runs up to the next group header, so it may
        // itself contain parentheses
        let body = &raw[whole.end()..];
        let headers: Vec<Captures<'_>> = yrc_word_re().captures_iter(body).collect();
        let words: Vec<LyricWord> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, caps)| {
                let word_start = capture_u64(caps, 1)?;
                let duration_cs = capture_u64(caps, 2)?;
                let text_start = caps.get(0)?.end();
                let text_end = match headers.get(i + 1) {
                    Some(next) => next.get(0)?.start(),
                    None => body.len(),
                };
                let word = &body[text_start..text_end];
                if word.is_empty() {
                    return None;
                }
                Some(LyricWord {
                    start_time: word_start,
                    end_time: word_start + duration_cs * 10,
                    word: word.to_string(),
                })
            })
            .collect();

        if words.is_empty() {
            continue;
        }

        lines.push(LyricLine {
            start_time: start,
            end_time: start + duration,
            words,
            ..LyricLine::default()
        });
    }

    lines
}

/// Which companion field a secondary LRC track fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Companion {
    Translation,
    Romanization,
}

/// Attach each companion line to the primary line whose start is nearest,
/// as long as it is within [`COMPANION_TOLERANCE_MS`].
pub fn attach_companion(lines: &mut [LyricLine], companion: &[LyricLine], kind: Companion) {
    for extra in companion {
        let text = extra.text();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let nearest = lines
            .iter_mut()
            .map(|line| (line.start_time.abs_diff(extra.start_time), line))
            .filter(|(dist, _)| *dist <= COMPANION_TOLERANCE_MS)
            .min_by_key(|(dist, _)| *dist);

        if let Some((_, line)) = nearest {
            match kind {
                Companion::Translation => line.translated_lyric = text.to_string(),
                Companion::Romanization => line.roman_lyric = text.to_string(),
            }
        }
    }
}

/// Prepend a credit line spanning `[0, first line start)`.  Skipped when the
/// lyrics start at zero, leaving no room for it.
pub fn with_credit(mut lines: Vec<LyricLine>, credit: &str) -> Vec<LyricLine> {
    let first = lines.first().map(|l| l.start_time).unwrap_or(0);
    if first == 0 || credit.is_empty() {
        return lines;
    }
    lines.insert(0, LyricLine::single_word(0, first, credit));
    lines
}
