//! Renders an ordered sequence of [`CaptionFrame`]s as SubRip (SRT) text or
//! as search-engine-mode lines. Purely textual; holds no decoding state.

use crate::frame::CaptionFrame;

const BOM: &str = "\u{FEFF}";

fn format_timestamp(ms: i64) -> String {
    let ms = ms.max(0);
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}

/// Renders frames as SubRip text. Writes a leading BOM unless `omit_bom`.
/// If `frames` is empty and `dummy` is set, emits a single one-second
/// placeholder entry instead of nothing.
pub fn render_srt(frames: &[CaptionFrame], omit_bom: bool, dummy: bool) -> String {
    let mut out = String::new();
    if !omit_bom {
        out.push_str(BOM);
    }

    if frames.is_empty() {
        if dummy {
            out.push_str("1\r\n00:00:00,000 --> 00:00:01,000\r\n\r\n");
        }
        return out;
    }

    for (i, frame) in frames.iter().enumerate() {
        out.push_str(&(i + 1).to_string());
        out.push_str("\r\n");
        out.push_str(&format_timestamp(frame.show_ms));
        out.push_str(" --> ");
        out.push_str(&format_timestamp(frame.hide_ms));
        out.push_str("\r\n");
        out.push_str(&frame.text);
        out.push_str("\r\n\r\n");
    }
    out
}

/// Renders frames in search-engine mode: `seconds_float|text` per line.
/// `show_ms` is already anchored to the configured offset and UTC
/// reference by the clock tracker, so no further adjustment happens here.
pub fn render_search_engine(frames: &[CaptionFrame]) -> String {
    let mut out = String::new();
    for frame in frames {
        let seconds = (frame.show_ms as f64) / 1000.0;
        out.push_str(&format!("{:.3}|{}\n", seconds, frame.text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(show: i64, hide: i64, text: &str) -> CaptionFrame {
        CaptionFrame {
            show_ms: show,
            hide_ms: hide,
            text: text.to_string(),
        }
    }

    #[test]
    fn formats_timestamp_zero_padded() {
        assert_eq!(format_timestamp(3_661_001), "01:01:01,001");
    }

    #[test]
    fn renders_single_frame_with_bom() {
        let frames = vec![frame(0, 1000, "hi")];
        let srt = render_srt(&frames, false, false);
        assert!(srt.starts_with(BOM));
        assert!(srt.contains("1\r\n00:00:00,000 --> 00:00:01,000\r\nhi\r\n\r\n"));
    }

    #[test]
    fn omits_bom_when_requested() {
        let frames = vec![frame(0, 1000, "hi")];
        let srt = render_srt(&frames, true, false);
        assert!(!srt.starts_with(BOM));
    }

    #[test]
    fn empty_input_produces_no_entries_without_dummy_flag() {
        let srt = render_srt(&[], true, false);
        assert_eq!(srt, "");
    }

    #[test]
    fn empty_input_with_dummy_flag_emits_one_placeholder() {
        let srt = render_srt(&[], true, true);
        assert_eq!(srt, "1\r\n00:00:00,000 --> 00:00:01,000\r\n\r\n");
    }

    #[test]
    fn search_engine_mode_formats_seconds_and_text() {
        let frames = vec![frame(500, 1500, "hi")];
        let text = render_search_engine(&frames);
        assert_eq!(text, "0.500|hi\n");
    }
}
