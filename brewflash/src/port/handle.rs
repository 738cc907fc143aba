//! Session-owned serial handle with primary/alternate port fallback.

use {
    crate::{
        error::{Error, Result},
        port::{DEFAULT_BAUD, DEFAULT_READ_TIMEOUT, Port, PortFactory, SerialConfig},
    },
    log::{debug, trace},
    std::time::Duration,
};

/// Lifecycle state of a [`DeviceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// No port is held.
    Closed,
    /// A port is open.
    Open,
}

/// Serial connection to the controller, owned by one update session.
///
/// The controller may enumerate under a different name after it resets, so
/// every open tries the primary port first and then the alternate.
pub struct DeviceHandle<F: PortFactory> {
    factory: F,
    primary: String,
    alternate: Option<String>,
    baud_rate: u32,
    timeout: Duration,
    port: Option<F::Port>,
}

impl<F: PortFactory> DeviceHandle<F> {
    /// Create a closed handle.
    pub fn new(factory: F, primary: impl Into<String>, alternate: Option<String>) -> Self {
        Self {
            factory,
            primary: primary.into(),
            alternate,
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_READ_TIMEOUT,
            port: None,
        }
    }

    /// Set the link baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current state.
    pub fn state(&self) -> HandleState {
        if self
            .port
            .is_some()
        {
            HandleState::Open
        } else {
            HandleState::Closed
        }
    }

    /// Name of the open port, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port
            .as_ref()
            .map(Port::name)
    }

    /// Primary port name.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Open the link, trying the primary port and then the alternate.
    ///
    /// Only valid from [`HandleState::Closed`].
    pub fn open(&mut self) -> Result<&str> {
        self.open_at(self.baud_rate)?;
        Ok(self
            .port_name()
            .unwrap_or_default())
    }

    /// Open at `baud` and close again immediately.
    ///
    /// Boards with native USB enter their bootloader when the host opens the
    /// port at 1200 baud and drops it.
    pub fn touch(&mut self, baud: u32) -> Result<()> {
        self.open_at(baud)?;
        self.close()
    }

    fn open_at(&mut self, baud: u32) -> Result<()> {
        if baud == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self
            .port
            .is_some()
        {
            return Err(Error::InvalidState(format!(
                "{} is already open",
                self.port_name()
                    .unwrap_or_default()
            )));
        }

        let candidates = std::iter::once(self.primary.as_str()).chain(self.alternate.as_deref());
        let mut last_error = None;
        for name in candidates {
            let config = SerialConfig::new(name, baud).with_timeout(self.timeout);
            match self
                .factory
                .open(&config)
            {
                Ok(mut port) => {
                    // Drop whatever the board printed while it booted.
                    port.clear_buffers()?;
                    debug!("Opened {name} at {baud} baud");
                    self.port = Some(port);
                    return Ok(());
                },
                Err(e) => {
                    trace!("Cannot open {name}: {e}");
                    last_error = Some(e);
                },
            }
        }

        Err(Error::Connection(match last_error {
            Some(e) => format!("cannot open {}: {e}", self.describe_ports()),
            None => format!("cannot open {}", self.describe_ports()),
        }))
    }

    /// Close the link. Closing a closed handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self
            .port
            .take()
        {
            port.close()?;
            debug!("Closed {}", port.name());
        }
        Ok(())
    }

    /// Borrow the open port.
    pub fn port_mut(&mut self) -> Result<&mut F::Port> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::InvalidState("serial link is closed".into()))
    }

    fn describe_ports(&self) -> String {
        match &self.alternate {
            Some(alt) => format!("{} or {alt}", self.primary),
            None => self
                .primary
                .clone(),
        }
    }
}

impl<F: PortFactory> Drop for DeviceHandle<F> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
