//! `capline devices`: acceleration devices and audio outputs.

use anyhow::Result;
use capline_gpu_hal::DeviceRegistry;
use clap::Args;

#[derive(Args, Debug)]
pub struct CmdDevices {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[cfg(feature = "cpal-output")]
fn audio_outputs() -> Vec<String> {
    let mut names = vec!["null".to_string()];
    names.extend(capline_audio::CpalAudioRenderer::device_names());
    names
}

#[cfg(not(feature = "cpal-output"))]
fn audio_outputs() -> Vec<String> {
    vec!["null".to_string()]
}

impl CmdDevices {
    pub fn run(self) -> Result<()> {
        let registry = DeviceRegistry::default();
        let devices = registry.list_devices();
        let outputs = audio_outputs();

        if self.json {
            let report = serde_json::json!({
                "hwaccel": devices,
                "audio_outputs": outputs,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("Acceleration devices:");
        for info in &devices {
            match &info.node {
                Some(node) => println!("  {:<14} {}", info.device.name(), node),
                None => println!("  {:<14} (not available)", info.device.name()),
            }
        }
        println!("Audio outputs:");
        for name in &outputs {
            println!("  {name}");
        }
        Ok(())
    }
}
