use {
    super::{FlashBackend, FlashTarget, Preparation},
    crate::{
        error::{Error, Result},
        image::FirmwareImage,
    },
    log::{debug, info, warn},
    std::{
        fs,
        path::PathBuf,
        process::Command,
        thread,
        time::Duration,
    },
};

/// Placeholder replaced by the port name in tool arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Placeholder replaced by the image path in tool arguments.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Runs a native programmer (e.g. avrdude) against the released port.
#[derive(Debug, Clone)]
pub struct ExternalToolFlash {
    program: PathBuf,
    args: Vec<String>,
    max_size: Option<usize>,
    touch_baud: Option<u32>,
    bootloader_delay: Duration,
    power_up_delay: Duration,
}

impl ExternalToolFlash {
    /// Run `program` with `args`; `{port}` and `{file}` are substituted.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_size: None,
            touch_baud: None,
            bootloader_delay: Duration::from_secs(1),
            power_up_delay: Duration::from_secs(6),
        }
    }

    /// Refuse images whose program data exceeds `bytes`.
    #[must_use]
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    /// Reset the board by opening the port at `baud` before programming.
    #[must_use]
    pub fn with_touch_baud(mut self, baud: u32) -> Self {
        self.touch_baud = Some(baud);
        self
    }

    /// Delays after the touch reset and after the programmer exits.
    #[must_use]
    pub fn with_delays(mut self, bootloader: Duration, power_up: Duration) -> Self {
        self.bootloader_delay = bootloader;
        self.power_up_delay = power_up;
        self
    }

    /// Arguments with placeholders filled in.
    pub fn command_args(&self, port_name: &str, file: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace(PORT_PLACEHOLDER, port_name)
                    .replace(FILE_PLACEHOLDER, file)
            })
            .collect()
    }

    fn check_size(&self, image: &FirmwareImage) -> Result<()> {
        let size = image.program_size()?;
        match self.max_size {
            Some(max) => {
                info!("Program size: {size} bytes out of max {max}");
                if size > max {
                    return Err(Error::InvalidImage(format!(
                        "program size {size} is bigger than the board's maximum of {max} bytes"
                    )));
                }
            },
            None => info!("Program size: {size} bytes"),
        }
        Ok(())
    }
}

impl FlashBackend for ExternalToolFlash {
    fn describe(&self) -> String {
        format!("external programmer {}", self.program.display())
    }

    fn preparation(&self) -> Preparation {
        Preparation::Release {
            touch_baud: self.touch_baud,
        }
    }

    fn flash(&mut self, image: &FirmwareImage, target: FlashTarget<'_>) -> Result<()> {
        let FlashTarget::Released { port_name } = target else {
            return Err(Error::InvalidState(
                "external programmer needs the serial port released".into(),
            ));
        };

        self.check_size(image)?;

        // Images that only exist in memory are handed over as a temp file,
        // removed once the programmer exits.
        let mut scratch = None;
        let file = match image.path() {
            Some(path) => path.to_path_buf(),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("brewflash-")
                    .tempdir()?;
                let path = dir
                    .path()
                    .join(image.name());
                fs::write(&path, image.data())?;
                scratch = Some(dir);
                path
            },
        };

        if self
            .touch_baud
            .is_some()
            && !self
                .bootloader_delay
                .is_zero()
        {
            thread::sleep(self.bootloader_delay);
        }

        let args = self.command_args(port_name, &file.to_string_lossy());
        info!(
            "Programming with: {} {}",
            self.program.display(),
            args.join(" ")
        );

        let mut command = Command::new(&self.program);
        command.args(&args);
        if let Some(dir) = file.parent() {
            if !dir
                .as_os_str()
                .is_empty()
            {
                command.current_dir(dir);
            }
        }
        let output = command.output().map_err(|e| {
            Error::Tool(format!("cannot run {}: {e}", self.program.display()))
        });
        if let Some(dir) = scratch {
            if let Err(e) = dir.close() {
                warn!("Cannot remove temporary image copy: {e}");
            }
        }
        let output = output?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("{line}");
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            info!("{line}");
        }

        if !output
            .status
            .success()
        {
            let last = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output");
            warn!("Programmer exited with {}", output.status);
            return Err(Error::Tool(format!(
                "{} exited with {}: {last}",
                self.program.display(),
                output.status
            )));
        }

        info!("Programmer done");
        if !self
            .power_up_delay
            .is_zero()
        {
            info!("Giving the board {:?} to power up", self.power_up_delay);
            thread::sleep(self.power_up_delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageFormat;

    fn image() -> FirmwareImage {
        FirmwareImage::from_bytes("brewpi.bin", ImageFormat::Binary, vec![0xAB; 100]).unwrap()
    }

    fn tool(args: &[&str]) -> ExternalToolFlash {
        ExternalToolFlash::new(
            "sh",
            args.iter()
                .map(ToString::to_string)
                .collect(),
        )
        .with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_command_args_placeholders() {
        let flash = ExternalToolFlash::new(
            "avrdude",
            vec!["-P".into(), "{port}".into(), "-U".into(), "flash:w:{file}:i".into()],
        );
        assert_eq!(
            flash.command_args("/dev/ttyACM0", "/tmp/brewpi.hex"),
            vec!["-P", "/dev/ttyACM0", "-U", "flash:w:/tmp/brewpi.hex:i"]
        );
    }

    #[test]
    fn test_preparation_carries_touch_baud() {
        assert_eq!(
            tool(&[]).preparation(),
            Preparation::Release { touch_baud: None }
        );
        assert_eq!(
            tool(&[])
                .with_touch_baud(1200)
                .preparation(),
            Preparation::Release {
                touch_baud: Some(1200)
            }
        );
    }

    #[test]
    fn test_oversized_image_is_refused() {
        let mut flash = tool(&["-c", "exit 0"]).with_max_size(50);
        let result = flash.flash(&image(), FlashTarget::Released { port_name: "COM3" });
        assert!(matches!(result, Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_missing_program_is_tool_error() {
        let mut flash = ExternalToolFlash::new("/nonexistent/avrdude", Vec::new())
            .with_delays(Duration::ZERO, Duration::ZERO);
        let result = flash.flash(&image(), FlashTarget::Released { port_name: "COM3" });
        assert!(matches!(result, Err(Error::Tool(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_run_sees_file_and_port() {
        let mut flash = tool(&["-c", "test -s \"$0\" && test \"$1\" = COM3", "{file}", "{port}"]);
        flash
            .flash(&image(), FlashTarget::Released { port_name: "COM3" })
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_in_memory_image_copy_is_removed_after_run() {
        let out = tempfile::tempdir().unwrap();
        let record = out
            .path()
            .join("seen");
        let mut flash = tool(&[
            "-c",
            "test -s \"$0\" && echo \"$0\" > \"$1\"",
            "{file}",
            record
                .to_str()
                .unwrap(),
        ]);
        flash
            .flash(&image(), FlashTarget::Released { port_name: "COM3" })
            .unwrap();

        let seen = fs::read_to_string(&record).unwrap();
        let copy = PathBuf::from(seen.trim());
        assert!(copy.ends_with("brewpi.bin"));
        assert!(!copy.exists());
        assert!(
            !copy
                .parent()
                .unwrap()
                .exists()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_tool_error() {
        let mut flash = tool(&["-c", "echo 'verification error' >&2; exit 1"]);
        match flash.flash(&image(), FlashTarget::Released { port_name: "COM3" }) {
            Err(Error::Tool(msg)) => assert!(msg.contains("verification error"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
