//! FFmpeg probe, filter graph builders, and encoder invocation
//!
//! All heavy lifting happens in one ffmpeg subprocess per job: trim/concat
//! for focus cuts, xstack for grids, overlay for picture-in-picture. The
//! graph builders are pure string assembly so they can be tested without an
//! encoder installed.

use crate::composite::types::{CompositeError, CompositeRequest, OutputFormat};
use crate::timeline::Segment;
use crate::types::PeerId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const PIP_MARGIN: u32 = 20;

/// Probed metadata for one source artifact.
#[derive(Debug, Clone, Copy)]
pub struct MediaInfo {
    pub duration_ms: u64,
    pub width: u32,
    pub height: u32,
}

/// Probe a media file for dimensions and duration.
pub async fn probe(path: &Path) -> Result<MediaInfo, CompositeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
            path.to_str().unwrap_or(""),
        ])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CompositeError::Probe {
            path: path.to_path_buf(),
            message: format!("failed to run ffprobe: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CompositeError::Probe {
            path: path.to_path_buf(),
            message: format!("ffprobe failed: {}", stderr.trim()),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout).ok_or_else(|| CompositeError::Probe {
        path: path.to_path_buf(),
        message: format!("unexpected ffprobe output: {}", stdout.trim()),
    })
}

/// Parse ffprobe csv output: one `width,height` line for the video stream
/// and one `duration` line for the container.
fn parse_probe_output(stdout: &str) -> Option<MediaInfo> {
    let mut width = None;
    let mut height = None;
    let mut duration_ms = None;

    for line in stdout.lines() {
        let line = line.trim().trim_end_matches(',');
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() >= 2 {
            width = parts[0].parse::<u32>().ok();
            height = parts[1].parse::<u32>().ok();
        } else if let Ok(secs) = parts[0].parse::<f64>() {
            duration_ms = Some((secs * 1000.0) as u64);
        }
    }

    Some(MediaInfo {
        duration_ms: duration_ms?,
        width: width?,
        height: height?,
    })
}

fn secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Scale into a `w`x`h` box preserving aspect ratio, black bars as needed.
fn fit_filter(w: u32, h: u32) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black"
    )
}

/// Build filter_complex for a focus edit: each segment trimmed out of its
/// source peer's input, timestamps reset, scaled to the output box, then all
/// segments concatenated in order. Produces `[vout]` and `[aout]`.
pub(crate) fn build_focus_graph(
    segments: &[Segment],
    inputs: &HashMap<PeerId, usize>,
    width: u32,
    height: u32,
) -> String {
    let mut filters = Vec::new();
    let mut video_labels = Vec::new();
    let mut audio_labels = Vec::new();

    for (i, seg) in segments.iter().enumerate() {
        let idx = inputs[&seg.source_peer];
        let start = secs(seg.start_offset_ms);
        let end = secs(seg.end_offset_ms());

        filters.push(format!(
            "[{idx}:v]trim=start={start}:end={end},setpts=PTS-STARTPTS,{}[v{i}]",
            fit_filter(width, height)
        ));
        filters.push(format!(
            "[{idx}:a]atrim=start={start}:end={end},asetpts=PTS-STARTPTS[a{i}]"
        ));
        video_labels.push(format!("[v{i}]"));
        audio_labels.push(format!("[a{i}]"));
    }

    let n = segments.len();
    if n > 1 {
        filters.push(format!(
            "{}concat=n={n}:v=1:a=0[vout]",
            video_labels.join("")
        ));
        filters.push(format!(
            "{}concat=n={n}:v=0:a=1[aout]",
            audio_labels.join("")
        ));
    } else {
        filters.push("[v0]null[vout]".to_string());
        filters.push("[a0]anull[aout]".to_string());
    }

    filters.join(";")
}

/// Near-square tile arrangement: columns = ceil(sqrt(n)).
pub(crate) fn grid_dimensions(n: usize) -> (usize, usize) {
    let cols = (n as f64).sqrt().ceil() as usize;
    let rows = n.div_ceil(cols);
    (cols, rows)
}

/// Build filter_complex tiling every input into a near-square xstack grid
/// with mixed audio. Produces `[vout]` and `[aout]`.
pub(crate) fn build_grid_graph(input_indices: &[usize], width: u32, height: u32) -> String {
    let n = input_indices.len();
    if n == 1 {
        let idx = input_indices[0];
        return format!(
            "[{idx}:v]{}[vout];[{idx}:a]anull[aout]",
            fit_filter(width, height)
        );
    }

    let (cols, rows) = grid_dimensions(n);
    // xstack needs even tile dimensions for yuv420p output
    let tile_w = (width as usize / cols) as u32 & !1;
    let tile_h = (height as usize / rows) as u32 & !1;

    let mut filters = Vec::new();
    let mut tile_labels = Vec::new();
    let mut positions = Vec::new();

    for (i, idx) in input_indices.iter().enumerate() {
        filters.push(format!("[{idx}:v]{}[t{i}]", fit_filter(tile_w, tile_h)));
        tile_labels.push(format!("[t{i}]"));
        let x = (i % cols) as u32 * tile_w;
        let y = (i / cols) as u32 * tile_h;
        positions.push(format!("{x}_{y}"));
    }

    filters.push(format!(
        "{}xstack=inputs={n}:layout={}:fill=black[vout]",
        tile_labels.join(""),
        positions.join("|")
    ));

    let audio_refs: Vec<String> = input_indices.iter().map(|i| format!("[{i}:a]")).collect();
    filters.push(format!(
        "{}amix=inputs={n}:duration=longest[aout]",
        audio_refs.join("")
    ));

    filters.join(";")
}

/// Build filter_complex with the dominant source full-frame and the
/// runner-up inset bottom-right at a quarter of the output width. Produces
/// `[vout]` and `[aout]`.
pub(crate) fn build_pip_graph(
    main_index: usize,
    inset_index: Option<usize>,
    width: u32,
    height: u32,
) -> String {
    let Some(inset) = inset_index else {
        return format!(
            "[{main_index}:v]{}[vout];[{main_index}:a]anull[aout]",
            fit_filter(width, height)
        );
    };

    let inset_width = (width / 4) & !1;
    format!(
        "[{main_index}:v]{}[main];\
         [{inset}:v]scale={inset_width}:-2[pip];\
         [main][pip]overlay=W-w-{PIP_MARGIN}:H-h-{PIP_MARGIN}[vout];\
         [{main_index}:a][{inset}:a]amix=inputs=2:duration=longest[aout]",
        fit_filter(width, height)
    )
}

/// Full ffmpeg argument list for one composite job.
pub(crate) fn encode_args(
    source_paths: &[PathBuf],
    filter_complex: &str,
    request: &CompositeRequest,
) -> Vec<String> {
    let mut args = vec!["-y".to_string()];

    for path in source_paths {
        args.extend(["-i".to_string(), path.to_string_lossy().to_string()]);
    }

    args.extend([
        "-filter_complex".to_string(),
        filter_complex.to_string(),
        "-map".to_string(),
        "[vout]".to_string(),
        "-map".to_string(),
        "[aout]".to_string(),
    ]);

    let crf = request.quality.crf();
    args.extend([
        "-c:v".to_string(),
        request.format.video_codec().to_string(),
    ]);
    match request.format {
        OutputFormat::Mp4 => {
            args.extend([
                "-preset".to_string(),
                request.quality.h264_preset().to_string(),
                "-crf".to_string(),
                crf.to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                "-movflags".to_string(),
                "+faststart".to_string(),
            ]);
        }
        OutputFormat::Webm => {
            args.extend([
                "-crf".to_string(),
                crf.to_string(),
                "-b:v".to_string(),
                "0".to_string(),
            ]);
        }
    }
    args.extend([
        "-c:a".to_string(),
        request.format.audio_codec().to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
    ]);

    // Grid and pip sources run for their full length; clamp to the session.
    args.extend(["-t".to_string(), format!("{}", secs(request.edl.duration_ms))]);

    // Progress output for tracking
    args.extend(["-progress".to_string(), "pipe:1".to_string()]);

    args.push(request.output_path.to_string_lossy().to_string());
    args
}

/// One `key=value` line of `-progress pipe:1` output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ProgressLine {
    /// Encoded media time so far, in microseconds.
    OutTimeUs(u64),
    End,
}

pub(crate) fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse().ok().map(ProgressLine::OutTimeUs),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// Spawn the encoder for one job.
pub(crate) fn spawn_encoder(args: &[String]) -> Result<tokio::process::Child, CompositeError> {
    tracing::info!("Starting ffmpeg composite: {:?}", args);
    Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(CompositeError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::types::CompositeLayout;
    use crate::timeline::EditDecisionList;

    fn seg(peer: &str, start_ms: u64, duration_ms: u64) -> Segment {
        Segment {
            source_peer: peer.into(),
            start_offset_ms: start_ms,
            duration_ms,
        }
    }

    #[test]
    fn focus_graph_trims_each_segment_from_its_source() {
        let segments = vec![seg("a", 0, 4000), seg("b", 4000, 6000)];
        let inputs = HashMap::from([(PeerId::new("a"), 0), (PeerId::new("b"), 1)]);

        let graph = build_focus_graph(&segments, &inputs, 1920, 1080);
        assert!(graph.contains("[0:v]trim=start=0:end=4"));
        assert!(graph.contains("[1:v]trim=start=4:end=10"));
        assert!(graph.contains("concat=n=2:v=1:a=0[vout]"));
        assert!(graph.contains("concat=n=2:v=0:a=1[aout]"));
    }

    #[test]
    fn focus_graph_single_segment_skips_concat() {
        let segments = vec![seg("a", 0, 5000)];
        let inputs = HashMap::from([(PeerId::new("a"), 0)]);

        let graph = build_focus_graph(&segments, &inputs, 1280, 720);
        assert!(!graph.contains("concat"));
        assert!(graph.contains("[vout]"));
        assert!(graph.contains("[aout]"));
    }

    #[test]
    fn grid_dimensions_stay_near_square() {
        assert_eq!(grid_dimensions(1), (1, 1));
        assert_eq!(grid_dimensions(2), (2, 1));
        assert_eq!(grid_dimensions(3), (2, 2));
        assert_eq!(grid_dimensions(4), (2, 2));
        assert_eq!(grid_dimensions(5), (3, 2));
        assert_eq!(grid_dimensions(9), (3, 3));
        assert_eq!(grid_dimensions(10), (4, 3));
    }

    #[test]
    fn grid_graph_positions_tiles_row_major() {
        let graph = build_grid_graph(&[0, 1, 2], 1920, 1080);
        // 3 tiles in a 2x2 grid of 960x540 tiles
        assert!(graph.contains("xstack=inputs=3:layout=0_0|960_0|0_540"));
        assert!(graph.contains("amix=inputs=3"));
    }

    #[test]
    fn grid_graph_single_tile_is_fullscreen() {
        let graph = build_grid_graph(&[0], 1920, 1080);
        assert!(!graph.contains("xstack"));
        assert!(graph.contains("scale=1920:1080"));
    }

    #[test]
    fn pip_graph_insets_the_runner_up() {
        let graph = build_pip_graph(0, Some(1), 1920, 1080);
        assert!(graph.contains("[1:v]scale=480:-2[pip]"));
        assert!(graph.contains("overlay=W-w-20:H-h-20[vout]"));
        assert!(graph.contains("amix=inputs=2"));
    }

    #[test]
    fn pip_graph_without_inset_is_fullscreen() {
        let graph = build_pip_graph(0, None, 1920, 1080);
        assert!(!graph.contains("overlay"));
        assert!(graph.contains("[vout]"));
    }

    #[test]
    fn encode_args_end_with_output_path() {
        let edl = EditDecisionList {
            duration_ms: 10_000,
            segments: vec![seg("a", 0, 10_000)],
        };
        let request = CompositeRequest::new("s1".into(), edl, CompositeLayout::Focus, "/tmp/out.mp4");
        let args = encode_args(&[PathBuf::from("/tmp/a.bin")], "[0:v]null[vout]", &request);

        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
        assert!(args.contains(&"-filter_complex".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.windows(2).any(|w| w == ["-t".to_string(), "10".to_string()]));
        assert!(args.windows(2).any(|w| w == ["-progress".to_string(), "pipe:1".to_string()]));
    }

    #[test]
    fn encode_args_pick_codecs_by_format() {
        let edl = EditDecisionList {
            duration_ms: 5_000,
            segments: vec![seg("a", 0, 5_000)],
        };
        let mut request =
            CompositeRequest::new("s1".into(), edl, CompositeLayout::Grid, "/tmp/out.webm");
        request.format = OutputFormat::Webm;
        let args = encode_args(&[PathBuf::from("/tmp/a.bin")], "[0:v]null[vout]", &request);

        let codec_pos = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[codec_pos + 1], "libvpx-vp9");
        assert!(args.windows(2).any(|w| w == ["-c:a".to_string(), "libopus".to_string()]));
        assert!(!args.contains(&"-movflags".to_string()));
    }

    #[test]
    fn progress_lines_parse_time_and_end() {
        assert_eq!(
            parse_progress_line("out_time_us=1500000"),
            Some(ProgressLine::OutTimeUs(1_500_000))
        );
        assert_eq!(parse_progress_line("progress=end"), Some(ProgressLine::End));
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("fps=30.0"), None);
    }

    #[test]
    fn probe_output_parses_stream_then_format() {
        let info = parse_probe_output("1920,1080\n12.345000\n").unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.duration_ms, 12_345);
    }
}
