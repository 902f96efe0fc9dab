// Helper-process decoder
//
// Drives a long-running external decoder (typically the CV model wrapped in
// a small script) over stdin/stdout pipes. Protocol, one request per line:
//
//   -> "TRIG <w> <h>\n" + w*h raw gray bytes     <- "1\n" or "0\n"
//   -> "CODE <w> <h>\n" + w*h raw gray bytes     <- "<code>\n" ("" for none)
//
// The child is spawned once per camera and lives for the scan; requests are
// serialized through a mutex so one HelperDecoder can serve several threads.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use crate::decode::{CodeDecoder, Frame, Roi, TriggerDetector};
use crate::error::{PackCamError, Result};

struct HelperPipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct HelperDecoder {
    pipes: Mutex<HelperPipes>,
}

impl HelperDecoder {
    /// Spawn the helper from a command line such as
    /// `python3 decoder.py --model packing.onnx`.
    pub fn spawn(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PackCamError::Decoder("empty decoder command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PackCamError::Decoder(format!("failed to spawn decoder: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PackCamError::Decoder("decoder stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| PackCamError::Decoder("decoder stdout unavailable".to_string()))?;

        Ok(Self {
            pipes: Mutex::new(HelperPipes { child, stdin, stdout }),
        })
    }

    fn request(&self, verb: &str, frame: &Frame) -> Result<String> {
        let mut pipes = self.pipes.lock().unwrap();

        let header = format!("{} {} {}\n", verb, frame.width, frame.height);
        pipes.stdin.write_all(header.as_bytes())?;
        pipes.stdin.write_all(&frame.data)?;
        pipes.stdin.flush()?;

        let mut line = String::new();
        let n = pipes.stdout.read_line(&mut line)?;
        if n == 0 {
            return Err(PackCamError::Decoder("decoder closed its pipe".to_string()));
        }
        Ok(line.trim_end().to_string())
    }
}

impl TriggerDetector for HelperDecoder {
    fn detect_trigger(&self, frame: &Frame, roi: Roi) -> Result<bool> {
        let cropped = frame.crop(roi);
        let reply = self.request("TRIG", &cropped)?;
        Ok(reply == "1")
    }
}

impl CodeDecoder for HelperDecoder {
    fn decode_code(&self, frame: &Frame, roi: Roi) -> Result<String> {
        let cropped = frame.crop(roi);
        self.request("CODE", &cropped)
    }
}

/// Spawns one helper process per camera from its configured command line.
pub struct HelperDecoderProvider;

impl crate::decode::DecoderProvider for HelperDecoderProvider {
    fn decoders(&self, camera: &crate::db::schema::Camera) -> Result<crate::decode::CameraDecoders> {
        let command = camera.decoder_cmd.as_deref().ok_or_else(|| {
            PackCamError::Decoder(format!("camera {} has no decoder command", camera.name))
        })?;
        let helper = std::sync::Arc::new(HelperDecoder::spawn(command)?);
        Ok(crate::decode::CameraDecoders {
            trigger: helper.clone(),
            code: helper,
        })
    }
}

impl Drop for HelperDecoder {
    fn drop(&mut self) {
        if let Ok(mut pipes) = self.pipes.lock() {
            let _ = pipes.child.kill();
            let _ = pipes.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `cat` echoes the header line back, which is enough to exercise the
    // request/reply framing without a real decoder binary.
    #[test]
    #[cfg(unix)]
    fn test_request_roundtrip_via_cat() {
        let decoder = HelperDecoder::spawn("cat").unwrap();
        let frame = Frame { width: 2, height: 1, data: vec![10, 20] };
        let reply = decoder.request("TRIG", &frame).unwrap();
        assert_eq!(reply, "TRIG 2 1");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(HelperDecoder::spawn("   ").is_err());
    }
}
