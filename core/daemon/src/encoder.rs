//! Encoder argument vector construction.
//!
//! The argv is derived once per session from its validated `LaunchSpec` and
//! stored with the record; restarts replay the stored vector unchanged.

use camstream_protocol::LaunchSpec;

use crate::config::EncoderConfig;

pub fn build_argv(config: &EncoderConfig, spec: &LaunchSpec) -> Vec<String> {
    let mut argv = vec![
        config.program.clone(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
        "-f".to_string(),
        config.input_driver.clone(),
        "-input_format".to_string(),
        spec.input_format.clone(),
        "-video_size".to_string(),
        spec.frame_size.to_string(),
        "-framerate".to_string(),
        spec.frame_rate.to_string(),
        "-i".to_string(),
        spec.device.clone(),
    ];
    argv.extend(spec.extra_args.iter().cloned());
    argv.push("-f".to_string());
    argv.push(config.output_format.clone());
    argv.push(spec.stream_name.clone());
    argv
}
