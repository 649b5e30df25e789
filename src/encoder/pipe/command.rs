//! ffmpeg invocation for the pipe backend
//!
//! Both raw input formats are declared on the command line; the pipes carry
//! nothing but frame bytes.

use std::path::{Path, PathBuf};

use crate::config::{AudioCodec, ContainerFormat, VideoCodec};
use crate::encoder::EncoderSettings;

#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    width: u32,
    height: u32,
    scale: Option<(u32, u32)>,
    /// Input frame rate, `fps / speed`
    input_rate: String,
    video_codec: VideoCodec,
    video_bitrate: u32,
    sample_rate: u32,
    channels: u16,
    audio_input: Option<PathBuf>,
    audio_codec: AudioCodec,
    audio_bitrate: u32,
    container: ContainerFormat,
    output_path: PathBuf,
}

impl FfmpegCommandBuilder {
    pub fn new(settings: &EncoderSettings, output_path: &Path) -> Self {
        let scale = (settings.output_width != settings.width
            || settings.output_height != settings.height)
            .then_some((settings.output_width, settings.output_height));
        Self {
            width: settings.width,
            height: settings.height,
            scale,
            input_rate: input_rate(settings.fps, settings.speed),
            video_codec: settings.video_codec,
            video_bitrate: settings.video_bitrate,
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            audio_input: None,
            audio_codec: settings.audio_codec,
            audio_bitrate: settings.audio_bitrate,
            container: settings.container,
            output_path: output_path.to_path_buf(),
        }
    }

    /// Read raw audio from this path (a FIFO) as the second input
    pub fn with_audio_input(mut self, path: PathBuf) -> Self {
        self.audio_input = Some(path);
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(), "warning".to_string(),
            "-y".to_string(),
            "-f".to_string(), "rawvideo".to_string(),
            "-pix_fmt".to_string(), "rgba".to_string(),
            "-s".to_string(), format!("{}x{}", self.width, self.height),
            "-r".to_string(), self.input_rate.clone(),
            "-i".to_string(), "pipe:0".to_string(),
        ];

        if let Some(audio) = &self.audio_input {
            args.extend(vec![
                "-f".to_string(), "f32le".to_string(),
                "-ar".to_string(), self.sample_rate.to_string(),
                "-ac".to_string(), self.channels.to_string(),
                "-i".to_string(), audio.to_string_lossy().to_string(),
            ]);
        }

        if let Some((w, h)) = self.scale {
            args.push("-vf".to_string());
            args.push(format!("scale={}:{}", w, h));
        }

        args.extend(vec![
            "-c:v".to_string(), self.video_codec.ffmpeg_encoder().to_string(),
            "-b:v".to_string(), self.video_bitrate.to_string(),
            "-pix_fmt".to_string(), "yuv420p".to_string(),
        ]);
        if self.video_codec == VideoCodec::H264 {
            args.extend(vec!["-preset".to_string(), "veryfast".to_string()]);
        }

        if self.audio_input.is_some() {
            args.extend(vec![
                "-c:a".to_string(), self.audio_codec.ffmpeg_encoder().to_string(),
                "-b:a".to_string(), self.audio_bitrate.to_string(),
            ]);
        }

        if self.container == ContainerFormat::Mp4 {
            args.extend(vec!["-movflags".to_string(), "+faststart".to_string()]);
        }

        args.extend(vec![
            "-f".to_string(), self.container.ffmpeg_format().to_string(),
            self.output_path.to_string_lossy().to_string(),
        ]);

        args
    }
}

/// Frame rate as ffmpeg parses it, exact for fractional speeds
fn input_rate(fps: u32, speed: f64) -> String {
    let speed_milli = (speed * 1000.0).round().max(1.0) as u64;
    let num = fps as u64 * 1000;
    if num % speed_milli == 0 {
        (num / speed_milli).to_string()
    } else {
        format!("{}/{}", num, speed_milli)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings::for_tests(1280, 720, 60, 48_000, 2)
    }

    #[test]
    fn test_default_builder() {
        let args = FfmpegCommandBuilder::new(&settings(), Path::new("out.mp4")).build();

        assert_eq!(args[4], "-f");
        assert_eq!(args[5], "rawvideo");
        assert_eq!(args[9], "1280x720");
        assert_eq!(args[11], "60");
        assert_eq!(args[13], "pipe:0");
        assert!(!args.contains(&"-vf".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_audio_input_declares_format() {
        let args = FfmpegCommandBuilder::new(&settings(), Path::new("out.mp4"))
            .with_audio_input(PathBuf::from("/tmp/audio.fifo"))
            .build();

        assert_eq!(&args[14..22], &["-f", "f32le", "-ar", "48000", "-ac", "2", "-i", "/tmp/audio.fifo"]);
        let ca = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[ca + 1], "aac");
    }

    #[test]
    fn test_scaling_and_container() {
        let mut s = settings();
        s.output_width = 640;
        s.output_height = 360;
        s.container = ContainerFormat::Webm;
        s.video_codec = VideoCodec::Vp9;
        let args = FfmpegCommandBuilder::new(&s, Path::new("out.webm")).build();

        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale=640:360");
        assert!(args.contains(&"libvpx-vp9".to_string()));
        assert!(!args.contains(&"-preset".to_string()));
        assert!(!args.contains(&"+faststart".to_string()));
    }

    #[test]
    fn test_input_rate_with_speed() {
        assert_eq!(input_rate(60, 1.0), "60");
        assert_eq!(input_rate(60, 2.0), "30");
        assert_eq!(input_rate(60, 0.75), "80");
        assert_eq!(input_rate(60, 0.7), "60000/700");
    }
}
