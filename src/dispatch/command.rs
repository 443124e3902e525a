use serde_json::Value;

use crate::error::BridgeError;
use crate::hal::SessionArguments;

/// A validated inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ListDevices,
    StartServer {
        device_name: String,
        arguments: SessionArguments,
    },
    StopServer,
    StartService,
    StopService,
    GetServerState,
    SetFrequency(i64),
    GetFrequency,
    SetSampleRate(i64),
    GetSampleRate,
    SetFrequencyCorrection(i32),
    GetFrequencyCorrection,
    SetGainMode(i32),
    SetTunerGain(i32),
    GetTunerGain,
    SetTunerGainPercentage(i32),
    SetMargin(i32),
    GetMargin,
    SetAmplitude(bool),
    SetAgcMode(bool),
    SetOffsetTuning(bool),
    SetDirectSampling(i32),
    GetRtlXtalFrequency,
    GetTunerXtalFrequency,
}

fn bad_payload(command: &str, expected: &str, payload: &Value) -> BridgeError {
    BridgeError::unexpected(format!("{}: expected {}, got {}", command, expected, payload))
}

fn int64(command: &str, payload: &Value) -> Result<i64, BridgeError> {
    payload
        .as_i64()
        .ok_or_else(|| bad_payload(command, "an integer", payload))
}

fn int32(command: &str, payload: &Value) -> Result<i32, BridgeError> {
    payload
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| bad_payload(command, "a 32-bit integer", payload))
}

/// `true`/`false`, or an integer where anything above zero means on
fn flag(command: &str, payload: &Value) -> Result<bool, BridgeError> {
    match payload {
        Value::Bool(b) => Ok(*b),
        _ => payload
            .as_i64()
            .map(|v| v > 0)
            .ok_or_else(|| bad_payload(command, "an integer or boolean", payload)),
    }
}

/// `[deviceName, {gain, samplerateHz, frequencyHz, ppm, amplitude?}]`
fn start_server(payload: &Value) -> Result<Command, BridgeError> {
    const NAME: &str = "startServer";
    let expected = "[deviceName, {gain, samplerateHz, frequencyHz, ppm}]";

    let (name, settings) = match payload.as_array().map(Vec::as_slice) {
        Some([name, settings]) => (name, settings),
        _ => return Err(bad_payload(NAME, expected, payload)),
    };
    let device_name = name
        .as_str()
        .ok_or_else(|| bad_payload(NAME, expected, payload))?
        .to_string();
    if !settings.is_object() {
        return Err(bad_payload(NAME, expected, payload));
    }

    let field = |key: &str| -> Result<i64, BridgeError> {
        settings[key]
            .as_i64()
            .ok_or_else(|| {
                BridgeError::unexpected(format!("{}: missing integer field '{}'", NAME, key))
            })
    };
    let gain = i32::try_from(field("gain")?)
        .map_err(|_| BridgeError::unexpected(format!("{}: gain out of range", NAME)))?;
    let ppm = i32::try_from(field("ppm")?)
        .map_err(|_| BridgeError::unexpected(format!("{}: ppm out of range", NAME)))?;
    let amplitude_on = match settings.get("amplitude") {
        None | Some(Value::Null) => false,
        Some(value) => flag(NAME, value)?,
    };

    Ok(Command::StartServer {
        device_name,
        arguments: SessionArguments::new(
            gain,
            field("samplerateHz")?,
            field("frequencyHz")?,
            ppm,
            amplitude_on,
        ),
    })
}

impl Command {
    /// Parse a named command and its payload.
    ///
    /// `Ok(None)` means the name is not a known command.
    pub fn parse(name: &str, payload: &Value) -> Result<Option<Command>, BridgeError> {
        let command = match name {
            "listDevices" => Command::ListDevices,
            "startServer" => start_server(payload)?,
            "stopServer" => Command::StopServer,
            "startService" => Command::StartService,
            "stopService" => Command::StopService,
            "getServerState" => Command::GetServerState,
            "setFrequency" => Command::SetFrequency(int64(name, payload)?),
            "getFrequency" => Command::GetFrequency,
            "setSamplingrate" => Command::SetSampleRate(int64(name, payload)?),
            "getSamplingrate" => Command::GetSampleRate,
            "setFrequencyCorrection" => Command::SetFrequencyCorrection(int32(name, payload)?),
            "getFrequencyCorrection" => Command::GetFrequencyCorrection,
            "setGainMode" => Command::SetGainMode(int32(name, payload)?),
            "setTunergain" => Command::SetTunerGain(int32(name, payload)?),
            "getTunergain" => Command::GetTunerGain,
            "setTunergainByPercentage" => Command::SetTunerGainPercentage(int32(name, payload)?),
            "setMargin" => Command::SetMargin(int32(name, payload)?),
            "getMargin" => Command::GetMargin,
            "setAmplitude" => Command::SetAmplitude(flag(name, payload)?),
            "setAgcMode" => Command::SetAgcMode(flag(name, payload)?),
            "setOffsetTuning" => Command::SetOffsetTuning(flag(name, payload)?),
            "setDirectSampling" => Command::SetDirectSampling(int32(name, payload)?),
            "getRtlXtalFrequency" => Command::GetRtlXtalFrequency,
            "getTunerXtalFrequency" => Command::GetTunerXtalFrequency,
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// Wire name
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListDevices => "listDevices",
            Self::StartServer { .. } => "startServer",
            Self::StopServer => "stopServer",
            Self::StartService => "startService",
            Self::StopService => "stopService",
            Self::GetServerState => "getServerState",
            Self::SetFrequency(_) => "setFrequency",
            Self::GetFrequency => "getFrequency",
            Self::SetSampleRate(_) => "setSamplingrate",
            Self::GetSampleRate => "getSamplingrate",
            Self::SetFrequencyCorrection(_) => "setFrequencyCorrection",
            Self::GetFrequencyCorrection => "getFrequencyCorrection",
            Self::SetGainMode(_) => "setGainMode",
            Self::SetTunerGain(_) => "setTunergain",
            Self::GetTunerGain => "getTunergain",
            Self::SetTunerGainPercentage(_) => "setTunergainByPercentage",
            Self::SetMargin(_) => "setMargin",
            Self::GetMargin => "getMargin",
            Self::SetAmplitude(_) => "setAmplitude",
            Self::SetAgcMode(_) => "setAgcMode",
            Self::SetOffsetTuning(_) => "setOffsetTuning",
            Self::SetDirectSampling(_) => "setDirectSampling",
            Self::GetRtlXtalFrequency => "getRtlXtalFrequency",
            Self::GetTunerXtalFrequency => "getTunerXtalFrequency",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_server() {
        let payload = json!(["rtl-sdr /dev/bus/usb/001/004", {
            "gain": 0, "samplerateHz": 2048000, "frequencyHz": 433920000, "ppm": -3
        }]);
        let command = Command::parse("startServer", &payload).unwrap().unwrap();
        assert_eq!(
            command,
            Command::StartServer {
                device_name: "rtl-sdr /dev/bus/usb/001/004".to_string(),
                arguments: SessionArguments::new(0, 2_048_000, 433_920_000, -3, false),
            }
        );
    }

    #[test]
    fn test_parse_start_server_with_amplitude() {
        let payload = json!(["HackRF", {
            "gain": 24, "samplerateHz": 8000000, "frequencyHz": 100000000, "ppm": 0, "amplitude": 1
        }]);
        match Command::parse("startServer", &payload).unwrap() {
            Some(Command::StartServer { arguments, .. }) => assert!(arguments.amplitude_on),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_payload_is_unexpected_failure() {
        let err = Command::parse("setFrequency", &json!("fast")).unwrap_err();
        assert_eq!(err.code(), "generalException");
        assert!(err.to_string().contains("setFrequency"));

        let err = Command::parse("startServer", &json!(["A", {"gain": 1, "ppm": 0}])).unwrap_err();
        assert!(err.to_string().contains("samplerateHz"));
    }

    #[test]
    fn test_flags_accept_int_and_bool() {
        assert_eq!(
            Command::parse("setAmplitude", &json!(2)).unwrap(),
            Some(Command::SetAmplitude(true))
        );
        assert_eq!(
            Command::parse("setAmplitude", &json!(0)).unwrap(),
            Some(Command::SetAmplitude(false))
        );
        assert_eq!(
            Command::parse("setAgcMode", &json!(true)).unwrap(),
            Some(Command::SetAgcMode(true))
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(Command::parse("selfDestruct", &Value::Null).unwrap(), None);
    }

    #[test]
    fn test_name_matches_parse() {
        for name in [
            "listDevices",
            "getSamplingrate",
            "setTunergainByPercentage",
            "getTunerXtalFrequency",
        ] {
            let payload = if name.starts_with("set") { json!(1) } else { Value::Null };
            assert_eq!(Command::parse(name, &payload).unwrap().unwrap().name(), name);
        }
    }
}
