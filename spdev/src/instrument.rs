//! A session with one instrument.
//!
//! The byte stream is owned by an [`IoTask`]. `Instrument` handles are cheap
//! clones which queue requests to that task, so a query always receives its
//! reply before the next command goes out.

use std::convert::TryFrom;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use spdev_protocol::scpi::{parse_device_error, parse_device_errors, parse_int, CommonCommand};
use spdev_protocol::{DeviceError, Identity, ScpiRequest, ScpiResponse};

use crate::address::Address;
use crate::bytestream::{self, ByteStream};
use crate::iotask::{IoHandler, IoTask};
use crate::transport::serial;
use crate::{sim, Error};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound of `SYSTem:ERRor?` polls in [`Instrument::drain_errors`].
pub const MAX_DRAINED_ERRORS: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long to wait for the reply to a query.
    pub timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub enum Request {
    Scpi { req: ScpiRequest, timeout: Duration },
    StartRecording,
    TakeRecording,
}

pub enum Response {
    Scpi(ScpiResponse),
    Recording(Vec<String>),
    Done,
}

pub struct Handler {
    stream: Box<dyn ByteStream>,
    recording: Option<Vec<String>>,
    /// Replies of timed out queries which may still arrive.
    pending: usize,
}

impl Handler {
    fn record(&mut self, line: &str) {
        if let Some(recording) = &mut self.recording {
            recording.push(line.to_string());
        }
    }

    /// Wait for the replies owed to timed out queries and throw them away.
    /// A reply which does not show up within `timeout` is assumed lost, as the
    /// firmware stays silent on a rejected query.
    async fn discard_pending(&mut self, timeout: Duration) -> crate::Result<()> {
        while self.pending > 0 {
            match bytestream::read_line(&mut self.stream, timeout).await {
                Ok(line) => {
                    log::warn!("Discarding late reply {:?}", line);
                    self.pending -= 1;
                }
                Err(err) if err.is_timeout() => {
                    log::debug!("Giving up on {} late replies", self.pending);
                    self.pending = 0;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn handle_scpi(&mut self, req: ScpiRequest, timeout: Duration) -> crate::Result<ScpiResponse> {
        match req {
            ScpiRequest::Write(line) => {
                self.discard_pending(timeout).await?;
                self.record(&line);
                bytestream::write_line(&mut self.stream, &line).await?;
                Ok(ScpiResponse::Done)
            }
            ScpiRequest::QueryString(line) => {
                self.discard_pending(timeout).await?;
                self.record(&line);
                match bytestream::query_line(&mut self.stream, &line, timeout).await {
                    Ok(reply) => Ok(ScpiResponse::String(reply)),
                    Err(err) => {
                        if err.is_timeout() {
                            self.pending += 1;
                        }
                        Err(err)
                    }
                }
            }
            ScpiRequest::ReadAll => {
                self.pending = 0;
                let data = bytestream::read_all(&mut self.stream).await?;
                Ok(ScpiResponse::Lines(bytestream::split_lines(&data)))
            }
        }
    }
}

#[async_trait]
impl IoHandler for Handler {
    type Request = Request;
    type Response = Response;

    async fn handle(&mut self, req: Self::Request) -> crate::Result<Self::Response> {
        match req {
            Request::Scpi { req, timeout } => self.handle_scpi(req, timeout).await.map(Response::Scpi),
            Request::StartRecording => {
                self.recording = Some(Vec::new());
                Ok(Response::Done)
            }
            Request::TakeRecording => Ok(Response::Recording(self.recording.take().unwrap_or_default())),
        }
    }
}

#[derive(Clone)]
pub struct Instrument {
    inner: IoTask<Handler>,
    address: String,
    timeout: Duration,
}

impl Instrument {
    pub fn new<S: ByteStream>(stream: S, address: String, options: SessionOptions) -> Self {
        let handler = Handler {
            stream: Box::new(stream),
            recording: None,
            pending: 0,
        };
        Self {
            inner: IoTask::new(handler),
            address,
            timeout: options.timeout,
        }
    }

    /// Open the port or start the simulator behind `addr`.
    pub async fn connect(addr: &Address, options: SessionOptions) -> crate::Result<Self> {
        match addr {
            Address::Serial { path, params } => {
                let stream = serial::open(path, params).await?;
                Ok(Self::new(stream, addr.to_string(), options))
            }
            Address::Sim { model } => {
                log::info!("Starting simulated {}", model);
                Ok(Self::new(sim::spawn(*model), addr.to_string(), options))
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Applies to this handle and clones made from it afterwards.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn request(&self, req: ScpiRequest) -> crate::Result<ScpiResponse> {
        let req = Request::Scpi {
            req,
            timeout: self.timeout,
        };
        match self.inner.request(req).await? {
            Response::Scpi(x) => Ok(x),
            _ => Err(Error::internal(anyhow::anyhow!("Unexpected response from I/O task"))),
        }
    }

    pub async fn write<T: Into<String>>(&self, line: T) -> crate::Result<()> {
        match self.request(ScpiRequest::Write(line.into())).await? {
            ScpiResponse::Done => Ok(()),
            _ => Err(Error::internal(anyhow::anyhow!("Unexpected response from I/O task"))),
        }
    }

    pub async fn query<T: Into<String>>(&self, line: T) -> crate::Result<String> {
        match self.request(ScpiRequest::QueryString(line.into())).await? {
            ScpiResponse::String(x) => Ok(x),
            _ => Err(Error::internal(anyhow::anyhow!("Unexpected response from I/O task"))),
        }
    }

    /// Return and discard all complete lines waiting in the input buffer.
    pub async fn clear_read_queue(&self) -> crate::Result<Vec<String>> {
        match self.request(ScpiRequest::ReadAll).await? {
            ScpiResponse::Lines(lines) => {
                for line in &lines {
                    log::debug!("Discarding {:?}", line);
                }
                Ok(lines)
            }
            _ => Err(Error::internal(anyhow::anyhow!("Unexpected response from I/O task"))),
        }
    }

    /// Record every line sent from now on, replacing a running recording.
    pub async fn start_recording(&self) -> crate::Result<()> {
        self.inner.request(Request::StartRecording).await?;
        Ok(())
    }

    /// Stop recording and return the lines sent since `start_recording()`.
    pub async fn take_recording(&self) -> crate::Result<Vec<String>> {
        match self.inner.request(Request::TakeRecording).await? {
            Response::Recording(x) => Ok(x),
            _ => Err(Error::internal(anyhow::anyhow!("Unexpected response from I/O task"))),
        }
    }

    pub async fn identify(&self) -> crate::Result<Identity> {
        let reply = self.query(CommonCommand::Identify.to_scpi()).await?;
        Ok(reply.parse()?)
    }

    /// Send `*RST` and give the firmware `settle` to come back up.
    pub async fn reset(&self, settle: Duration) -> crate::Result<()> {
        log::info!("Resetting {}", self.address);
        self.write(CommonCommand::Reset.to_scpi()).await?;
        sleep(settle).await;
        Ok(())
    }

    /// Pop the oldest entry of the error queue. Code 0 means the queue was empty.
    pub async fn next_error(&self) -> crate::Result<DeviceError> {
        let reply = self.query(CommonCommand::NextError.to_scpi()).await?;
        Ok(parse_device_error(&reply)?)
    }

    pub async fn all_errors(&self) -> crate::Result<Vec<DeviceError>> {
        let reply = self.query(CommonCommand::AllErrors.to_scpi()).await?;
        Ok(parse_device_errors(&reply)?)
    }

    pub async fn error_count(&self) -> crate::Result<u32> {
        let reply = self.query(CommonCommand::ErrorCount.to_scpi()).await?;
        let count = parse_int(&reply)?;
        u32::try_from(count).map_err(|_| Error::unexpected_response(reply))
    }

    /// Empty the error queue by polling `SYSTem:ERRor?` until it reports no error.
    pub async fn drain_errors(&self) -> crate::Result<Vec<DeviceError>> {
        let mut ret = Vec::new();
        for _ in 0..MAX_DRAINED_ERRORS {
            let err = self.next_error().await?;
            if !err.is_error() {
                return Ok(ret);
            }
            log::warn!("{} reported {}", self.address, err);
            ret.push(err);
        }
        log::error!("Error queue of {} did not empty after {} reads", self.address, MAX_DRAINED_ERRORS);
        Ok(ret)
    }

    /// Fail with the oldest queued device error, if there is one.
    pub async fn check_error(&self) -> crate::Result<()> {
        let err = self.next_error().await?;
        if err.is_error() {
            return Err(Error::Device(err));
        }
        Ok(())
    }

    /// Stop the I/O task, which closes the port. Further requests fail.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Model;
    use tokio::io::{duplex, AsyncWriteExt};

    fn simulated(model: Model) -> Instrument {
        let options = SessionOptions {
            timeout: Duration::from_millis(200),
        };
        Instrument::new(sim::spawn(model), format!("sim::{}", model), options)
    }

    #[tokio::test]
    async fn identify_simulated_instruments() {
        let dac = simulated(Model::SpDac);
        let idn = dac.identify().await.unwrap();
        assert_eq!(idn.to_string(), "SPDev,SPDAC,SP-0001,0.3-1.2");

        let smu = simulated(Model::SpSmu);
        let idn = smu.identify().await.unwrap();
        assert_eq!(idn.manufacturer, "SPDev");
        assert_eq!(idn.model, "SPSMU");
        assert_eq!(idn.serial, "SP-0002");
    }

    #[tokio::test]
    async fn rejected_query_times_out() {
        let dac = simulated(Model::SpDac);
        let err = dac.query("SOUR:VOLT? 3").await.unwrap_err();
        assert!(err.is_timeout());
        let err = dac.next_error().await.unwrap();
        assert_eq!(err.code, -222);
        assert!(matches!(dac.check_error().await, Ok(())));
    }

    #[tokio::test]
    async fn drain_error_queue() {
        let smu = simulated(Model::SpSmu);
        smu.write("SOUR:FOO 1").await.unwrap();
        smu.write("SOUR:VOLT 1,11").await.unwrap();
        assert_eq!(smu.error_count().await.unwrap(), 2);
        let errors = smu.drain_errors().await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], DeviceError::new(-113, "Undefined header"));
        assert_eq!(errors[1].code, -222);
        assert_eq!(smu.error_count().await.unwrap(), 0);
        assert!(smu.all_errors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_sent_lines() {
        let dac = simulated(Model::SpDac);
        dac.write("SOUR:VOLT 1,1").await.unwrap();
        dac.start_recording().await.unwrap();
        dac.write("SOUR:VOLT 1,2").await.unwrap();
        dac.query("SOUR:VOLT:LAST? 1").await.unwrap();
        let lines = dac.take_recording().await.unwrap();
        assert_eq!(lines, vec!["SOUR:VOLT 1,2", "SOUR:VOLT:LAST? 1"]);
        assert!(dac.take_recording().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_lingering_lines() {
        let (host, mut device) = duplex(1024);
        let instrument = Instrument::new(host, "test".to_string(), SessionOptions::default());
        device.write_all(b"late reply\r\nanother\n").await.unwrap();
        let lines = instrument.clear_read_queue().await.unwrap();
        assert_eq!(lines, vec!["late reply", "another"]);
        assert!(instrument.clear_read_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_the_next_one() {
        let (host, mut device) = duplex(1024);
        let options = SessionOptions {
            timeout: Duration::from_millis(50),
        };
        let instrument = Instrument::new(host, "test".to_string(), options);
        let peer = tokio::spawn(async move {
            let line = bytestream::read_line(&mut device, Duration::from_secs(1)).await.unwrap();
            assert_eq!(line, "SOUR:VOLT? 1");
            sleep(Duration::from_millis(80)).await;
            device.write_all(b"1.0\n").await.unwrap();
            let line = bytestream::read_line(&mut device, Duration::from_secs(1)).await.unwrap();
            assert_eq!(line, "SOUR:VOLT? 2");
            device.write_all(b"2.0\n").await.unwrap();
            device
        });
        let err = instrument.query("SOUR:VOLT? 1").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(instrument.query("SOUR:VOLT? 2").await.unwrap(), "2.0");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn missing_late_reply_is_given_up() {
        let dac = simulated(Model::SpDac);
        assert!(dac.query("SOUR:VOLT? 3").await.unwrap_err().is_timeout());
        assert!(dac.query("SOUR:VOLT? 4").await.unwrap_err().is_timeout());
        dac.write("SOUR:VOLT 1,1.5").await.unwrap();
        assert_eq!(dac.query("SOUR:VOLT? 1").await.unwrap(), "1.5");
    }

    #[tokio::test]
    async fn disconnected_instrument_fails() {
        let dac = simulated(Model::SpDac);
        dac.disconnect();
        assert!(matches!(dac.identify().await, Err(Error::Internal(_))));
    }
}
