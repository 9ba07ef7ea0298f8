//! Output device selection for the standalone host.
//!
//! Tries the user's preferred device first, then the system default, then
//! anything that validates against the requested stereo configuration.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};

pub struct SelectedDevice {
    pub device: Device,
    pub name: String,
    pub is_default: bool,
    /// Present when the preferred device was unavailable and a fallback was
    /// chosen instead.
    pub fallback_reason: Option<String>,
}

pub fn select_output_device(
    sample_rate: u32,
    preferred_name: Option<&str>,
) -> Result<SelectedDevice, String> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let mut fallback_reason = None;

    if let Some(name) = preferred_name {
        match find_device_by_name(&host, name) {
            Some(device) if validates(&device, sample_rate) => {
                return Ok(SelectedDevice {
                    name: device.name().unwrap_or_else(|_| name.to_string()),
                    is_default: name == default_name,
                    device,
                    fallback_reason: None,
                });
            }
            Some(_) => {
                fallback_reason =
                    Some(format!("'{}' does not support the requested format", name));
            }
            None => {
                fallback_reason = Some(format!("no output device named '{}'", name));
            }
        }
    }

    let candidates = std::iter::once(host.default_output_device())
        .flatten()
        .chain(host.output_devices().into_iter().flatten());
    for device in candidates {
        if validates(&device, sample_rate) {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            return Ok(SelectedDevice {
                is_default: name == default_name,
                name,
                device,
                fallback_reason,
            });
        }
    }

    Err("No suitable audio output device found".to_string())
}

fn find_device_by_name(host: &Host, name: &str) -> Option<Device> {
    host.output_devices()
        .ok()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

fn validates(device: &Device, sample_rate: u32) -> bool {
    match device.supported_output_configs() {
        Ok(mut configs) => configs.any(|cfg| {
            cfg.channels() == 2
                && cfg.min_sample_rate().0 <= sample_rate
                && cfg.max_sample_rate().0 >= sample_rate
        }),
        Err(_) => false,
    }
}

/// Print every output device with a validation mark for the given rate.
pub fn list_output_devices(sample_rate: u32) {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    println!("Available audio output devices:");
    println!(
        "(Devices marked with + support {} Hz stereo output)\n",
        sample_rate
    );

    match host.output_devices() {
        Ok(devices) => {
            let mut found = false;
            for device in devices {
                if let Ok(name) = device.name() {
                    found = true;
                    let mark = if validates(&device, sample_rate) { "+" } else { "-" };
                    let default_mark = if name == default_name { " [DEFAULT]" } else { "" };
                    println!("  {} {}{}", mark, name, default_mark);
                }
            }
            if !found {
                println!("  (none)");
            }
        }
        Err(e) => eprintln!("Failed to enumerate output devices: {}", e),
    }
}
