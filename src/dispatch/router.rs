use serde_json::{json, Value};

use super::Command;
use crate::engine::{Role, SessionKernel};
use crate::error::BridgeError;

fn ok() -> Value {
    json!("OK")
}

/// Run one command inside the control context.
///
/// Preconditions (role occupied or free, device known) are checked by the
/// kernel before any state changes.
pub(crate) async fn execute(
    kernel: &mut SessionKernel,
    command: Command,
) -> Result<Value, BridgeError> {
    match command {
        Command::ListDevices => {
            let names: Vec<String> = kernel
                .registry()
                .list_devices()
                .await
                .into_iter()
                .map(|d| d.display_name)
                .collect();
            Ok(json!(names))
        }
        Command::StartServer {
            device_name,
            arguments,
        } => {
            kernel.start_server(&device_name, arguments).await?;
            Ok(ok())
        }
        Command::StopServer => {
            kernel.stop_server()?;
            Ok(ok())
        }
        Command::StartService => {
            kernel.start_service()?;
            Ok(Value::Null)
        }
        Command::StopService => {
            kernel.stop_service()?;
            Ok(Value::Null)
        }
        Command::GetServerState => Ok(kernel
            .snapshot(Role::Server)
            .map(|s| json!(s.state.name()))
            .unwrap_or(Value::Null)),

        Command::SetFrequency(hz) => {
            kernel.with_device("setFrequency", |d| d.set_frequency(hz))?;
            Ok(Value::Null)
        }
        Command::GetFrequency => Ok(json!(kernel.with_device("getFrequency", |d| d.frequency())?)),
        Command::SetSampleRate(hz) => {
            kernel.with_device("setSamplingrate", |d| d.set_sample_rate(hz))?;
            Ok(Value::Null)
        }
        Command::GetSampleRate => Ok(json!(
            kernel.with_device("getSamplingrate", |d| d.sample_rate())?
        )),
        Command::SetFrequencyCorrection(ppm) => {
            kernel.with_device("setFrequencyCorrection", |d| d.set_frequency_correction(ppm))?;
            Ok(Value::Null)
        }
        Command::GetFrequencyCorrection => Ok(json!(
            kernel.with_device("getFrequencyCorrection", |d| d.frequency_correction())?
        )),
        Command::SetGainMode(mode) => {
            kernel.with_device("setGainMode", |d| d.set_gain_mode(mode))?;
            Ok(Value::Null)
        }
        Command::SetTunerGain(gain) => {
            kernel.with_device("setTunergain", |d| d.set_tuner_gain(gain))?;
            Ok(Value::Null)
        }
        Command::GetTunerGain => Ok(json!(kernel.with_device("getTunergain", |d| d.tuner_gain())?)),
        Command::SetTunerGainPercentage(percent) => {
            kernel.with_device("setTunergainByPercentage", |d| {
                d.set_tuner_gain_percentage(percent)
            })?;
            Ok(Value::Null)
        }
        Command::SetMargin(margin) => {
            kernel.with_device("setMargin", |d| d.set_margin(margin))?;
            Ok(Value::Null)
        }
        Command::GetMargin => Ok(json!(kernel.with_device("getMargin", |d| d.margin())?)),
        Command::SetAmplitude(on) => {
            kernel.with_device("setAmplitude", |d| d.set_amplitude(on))?;
            Ok(ok())
        }
        Command::SetAgcMode(on) => {
            kernel.with_device("setAgcMode", |d| d.set_agc_mode(on))?;
            Ok(Value::Null)
        }
        Command::SetOffsetTuning(on) => {
            kernel.with_device("setOffsetTuning", |d| d.set_offset_tuning(on))?;
            Ok(Value::Null)
        }
        Command::SetDirectSampling(mode) => {
            kernel.with_device("setDirectSampling", |d| d.set_direct_sampling(mode))?;
            Ok(Value::Null)
        }
        Command::GetRtlXtalFrequency => Ok(json!(
            kernel.with_device("getRtlXtalFrequency", |d| d.rtl_xtal_frequency())?
        )),
        Command::GetTunerXtalFrequency => Ok(json!(
            kernel.with_device("getTunerXtalFrequency", |d| d.tuner_xtal_frequency())?
        )),
    }
}
