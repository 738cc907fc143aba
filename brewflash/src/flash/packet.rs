use {
    super::{FlashBackend, FlashTarget, Preparation},
    crate::{
        error::{Error, Result},
        image::FirmwareImage,
        protocol::{
            link::{DeviceLink, Pacing, PlainLogExpander},
            ymodem::{TransferOutcome, YmodemConfig, YmodemTransfer},
        },
    },
    log::info,
};

/// Progress callback: (bytes sent, total bytes).
pub type ProgressFn = Box<dyn FnMut(usize, usize)>;

/// Streams the image over the open link with YMODEM.
pub struct PacketTransportFlash {
    pacing: Pacing,
    config: YmodemConfig,
    transfer_name: String,
    progress: Option<ProgressFn>,
}

impl PacketTransportFlash {
    /// Create a backend with default timings.
    pub fn new() -> Self {
        Self {
            pacing: Pacing::default(),
            config: YmodemConfig::default(),
            transfer_name: "binary".into(),
            progress: None,
        }
    }

    /// Set the delays used around the flash-mode request.
    #[must_use]
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set the transfer options.
    #[must_use]
    pub fn with_config(mut self, config: YmodemConfig) -> Self {
        self.config = config;
        self
    }

    /// Report progress after each acknowledged packet.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl Default for PacketTransportFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashBackend for PacketTransportFlash {
    fn describe(&self) -> String {
        "YMODEM over the serial link".into()
    }

    fn preparation(&self) -> Preparation {
        Preparation::KeepOpen
    }

    fn flash(&mut self, image: &FirmwareImage, target: FlashTarget<'_>) -> Result<()> {
        let FlashTarget::Link(port) = target else {
            return Err(Error::InvalidState(
                "packet transfer needs the open serial link".into(),
            ));
        };

        DeviceLink::new(&mut *port, self.pacing, &PlainLogExpander).enter_flash_mode()?;

        let mut noop = |_: usize, _: usize| {};
        let progress: &mut dyn FnMut(usize, usize) = match self
            .progress
            .as_mut()
        {
            Some(p) => p.as_mut(),
            None => &mut noop,
        };

        let outcome = YmodemTransfer::with_config(port, self.config.clone()).transfer(
            &self.transfer_name,
            image.data(),
            progress,
        )?;

        match outcome {
            TransferOutcome::Completed => {
                info!("File flashed successfully");
                Ok(())
            },
            TransferOutcome::Aborted => Err(Error::Transfer("receiver aborted the transfer".into())),
            TransferOutcome::Rejected(byte) => Err(Error::Transfer(format!(
                "receiver answered 0x{byte:02X} instead of ACK"
            ))),
        }
    }
}
