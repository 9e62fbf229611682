//! Device session
//!
//! Wraps one opened sg handle together with the protocol generation and the
//! optional driver features negotiated for it. A session is created and used
//! by a single worker thread.

use crate::cdb::{Capacity, Command, READ_CAPACITY_16_LEN};
use crate::error::SessionError;
use crate::sense::classify;
use crate::sg::protocol::{protocol_for, RawCompletion, Request, SgProtocol};
use crate::sg::shim::{ReservedMapping, SgDevice};
use crate::sg::sys::*;
use crate::sg::{format_version, Generation};
use nix::libc;
use serde::Serialize;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the caller asks the session to negotiate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Force a protocol generation instead of the newest available.
    pub generation: Option<Generation>,
    /// Ask for nanosecond command durations.
    pub ns_timing: bool,
    /// Ask for relaxed (more asynchronous) queueing.
    pub more_async: bool,
    /// Ask for exclusive wait-queue wakeups.
    pub excl_waitq: bool,
    /// Grow the reserved buffer to at least this many bytes.
    pub reserve_bytes: usize,
    /// Receive specific pack_ids instead of any completion.
    pub force_pack_id: bool,
}

/// Driver features actually granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Features {
    /// Durations are in nanoseconds.
    pub ns_timing: bool,
    /// Relaxed queueing is on.
    pub more_async: bool,
    /// Exclusive wait-queue wakeups are on.
    pub excl_waitq: bool,
    /// Receives match on pack_id.
    pub force_pack_id: bool,
}

/// One negotiated device handle.
pub struct DeviceSession {
    // Dropped before `device`.
    mapping: Option<ReservedMapping>,
    device: Box<dyn SgDevice>,
    protocol: &'static dyn SgProtocol,
    path: String,
    version: i32,
    features: Features,
    reserved: usize,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("generation", &self.generation())
            .field("features", &self.features)
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

fn control_err<'a>(
    path: &'a str,
    what: &'static str,
) -> impl FnOnce(io::Error) -> SessionError + 'a {
    move |source| SessionError::Control {
        path: path.to_string(),
        what,
        source,
    }
}

impl DeviceSession {
    /// Negotiate a session on an opened device.
    pub fn open(
        device: Box<dyn SgDevice>,
        path: &str,
        opts: &SessionOptions,
    ) -> Result<Self, SessionError> {
        let version = device
            .version_num()
            .map_err(control_err(path, "SG_GET_VERSION_NUM"))?;
        if version < SG_MIN_VERSION {
            return Err(SessionError::VersionTooOld {
                path: path.to_string(),
                found: version,
                required: SG_MIN_VERSION,
            });
        }

        let generation = match opts.generation {
            Some(g) if version < g.min_version() => {
                return Err(SessionError::GenerationUnavailable {
                    path: path.to_string(),
                    generation: g,
                    found: version,
                    required: g.min_version(),
                });
            }
            Some(g) => g,
            None => Generation::best_for(version),
        };

        let mut session = Self {
            mapping: None,
            device,
            protocol: protocol_for(generation),
            path: path.to_string(),
            version,
            features: Features::default(),
            reserved: 0,
        };
        session.negotiate_extended(opts);
        session.grow_reserved(opts.reserve_bytes)?;
        if opts.force_pack_id {
            session
                .device
                .set_force_pack_id(true)
                .map_err(control_err(path, "SG_SET_FORCE_PACK_ID"))?;
            session.features.force_pack_id = true;
        }

        info!(
            path,
            version = %format_version(version),
            generation = %generation,
            ns_timing = session.features.ns_timing,
            more_async = session.features.more_async,
            excl_waitq = session.features.excl_waitq,
            reserved = session.reserved,
            "sg session ready"
        );
        Ok(session)
    }

    fn negotiate_extended(&mut self, opts: &SessionOptions) {
        let mut wanted = 0;
        if opts.ns_timing {
            wanted |= SG_CTL_FLAGM_TIME_IN_NS;
        }
        if opts.more_async {
            wanted |= SG_CTL_FLAGM_MORE_ASYNC;
        }
        if opts.excl_waitq {
            wanted |= SG_CTL_FLAGM_EXCL_WAITQ;
        }
        if wanted == 0 {
            return;
        }
        if self.version < SG_V4_VERSION {
            warn!(
                path = %self.path,
                version = %format_version(self.version),
                "extended features need sg driver 4.0 or later, continuing without them"
            );
            return;
        }

        let mut info = SgExtendedInfo::set_ctl_flags(wanted);
        match self.device.set_get_extended(&mut info) {
            Ok(()) => {
                let granted = info.ctl_flags & wanted;
                self.features.ns_timing = granted & SG_CTL_FLAGM_TIME_IN_NS != 0;
                self.features.more_async = granted & SG_CTL_FLAGM_MORE_ASYNC != 0;
                self.features.excl_waitq = granted & SG_CTL_FLAGM_EXCL_WAITQ != 0;
                if granted != wanted {
                    warn!(
                        path = %self.path,
                        wanted,
                        granted,
                        "driver refused some extended features"
                    );
                }
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "SG_SET_GET_EXTENDED failed, continuing without extended features");
            }
        }
    }

    fn grow_reserved(&mut self, want: usize) -> Result<(), SessionError> {
        let current = self
            .device
            .reserved_size()
            .map_err(control_err(&self.path, "SG_GET_RESERVED_SIZE"))?;
        self.reserved = current.max(0) as usize;
        if want == 0 || self.reserved >= want {
            return Ok(());
        }
        let request = i32::try_from(want).unwrap_or(i32::MAX);
        if let Err(e) = self.device.set_reserved_size(request) {
            warn!(path = %self.path, want, error = %e, "SG_SET_RESERVED_SIZE failed");
        }
        self.reserved = self
            .device
            .reserved_size()
            .map_err(control_err(&self.path, "SG_GET_RESERVED_SIZE"))?
            .max(0) as usize;
        if self.reserved < want {
            warn!(
                path = %self.path,
                want,
                got = self.reserved,
                "reserved buffer smaller than one transfer"
            );
        } else {
            debug!(path = %self.path, reserved = self.reserved, "reserved buffer grown");
        }
        Ok(())
    }

    /// Queue one request.
    #[inline]
    pub fn submit(&self, req: &Request<'_>) -> io::Result<()> {
        self.protocol.submit(self.device.as_ref(), req)
    }

    /// Fetch one completion.
    #[inline]
    pub fn receive(&self, wanted: Option<i32>) -> io::Result<RawCompletion> {
        self.protocol.receive(self.device.as_ref(), wanted)
    }

    /// Completions ready to be received.
    pub fn num_waiting(&self) -> io::Result<u32> {
        Ok(self.device.num_waiting()?.max(0) as u32)
    }

    /// Block up to `timeout` for a completion.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.device.wait_readable(timeout)
    }

    /// Duration of a completion, when nanosecond timing was granted.
    pub fn duration_of(&self, raw: &RawCompletion) -> Option<Duration> {
        self.features
            .ns_timing
            .then(|| Duration::from_nanos(u64::from(raw.duration)))
    }

    /// Issue one READ CAPACITY(16) through the asynchronous path and wait
    /// for it. Only used during setup, before any other command is queued.
    pub fn read_capacity(&self, pack_id: i32, timeout: Duration) -> Result<Capacity, SessionError> {
        let cmd = Command::read_capacity();
        let mut data = [0u8; READ_CAPACITY_16_LEN as usize];
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let fail = |reason: String| SessionError::Capacity {
            path: self.path.clone(),
            reason,
        };

        let req = Request {
            cdb: cmd.as_bytes(),
            pack_id,
            direction: cmd.direction(),
            data: data.as_mut_ptr(),
            xfer_len: cmd.xfer_len(),
            sense: sense.as_mut_ptr(),
            sense_len: SENSE_BUFF_LEN as u8,
            flags: 0,
            timeout_ms: timeout.as_millis().min(u128::from(u32::MAX)) as u32,
        };
        self.submit(&req).map_err(|e| fail(format!("submit: {e}")))?;

        let deadline = Instant::now() + timeout;
        let raw = loop {
            match self.receive(Some(pack_id)) {
                Ok(raw) if raw.pack_id == pack_id => break raw,
                Ok(raw) => return Err(fail(format!("unexpected pack_id {}", raw.pack_id))),
                Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN | libc::EBUSY)) => {
                    if Instant::now() >= deadline {
                        return Err(fail("timed out waiting for completion".into()));
                    }
                    self.wait_readable(Duration::from_millis(10))
                        .map_err(|e| fail(format!("poll: {e}")))?;
                }
                Err(e) => return Err(fail(format!("receive: {e}"))),
            }
        };

        let category = classify(raw.status, raw.host_status, raw.driver_status, &sense);
        if !category.is_success() {
            return Err(fail(category.to_string()));
        }
        Capacity::from_response(&data).ok_or_else(|| fail("short response".into()))
    }

    /// Map the reserved buffer for mmap transfers.
    pub fn map_reserved(&mut self, len: usize) -> Result<(), SessionError> {
        let mapping = self
            .device
            .map_reserved(len)
            .map_err(control_err(&self.path, "mmap of reserved buffer"))?;
        self.mapping = Some(mapping);
        Ok(())
    }

    /// Whether the reserved buffer is mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Negotiated protocol generation.
    pub fn generation(&self) -> Generation {
        self.protocol.generation()
    }

    /// Granted features.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Driver version number.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Reserved buffer size after negotiation.
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    /// Device path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sg::mem::{FaultPlan, MemDevice, MemDisk, MEM_DEFAULT_RESERVED, MEM_DEFAULT_VERSION};

    fn device(version: i32, plan: FaultPlan) -> Box<dyn SgDevice> {
        Box::new(MemDevice::with_plan(MemDisk::new(1024, 512), version, plan))
    }

    #[test]
    fn test_picks_extended_on_v4_driver() {
        let s = DeviceSession::open(device(40045, FaultPlan::new()), "/dev/sg0", &SessionOptions::default())
            .unwrap();
        assert_eq!(s.generation(), Generation::Extended);
        assert_eq!(s.version(), 40045);
        assert_eq!(s.features(), Features::default());
    }

    #[test]
    fn test_picks_legacy_on_v3_driver() {
        let s = DeviceSession::open(device(30536, FaultPlan::new()), "/dev/sg0", &SessionOptions::default())
            .unwrap();
        assert_eq!(s.generation(), Generation::Legacy);
    }

    #[test]
    fn test_legacy_override_on_v4_driver() {
        let opts = SessionOptions {
            generation: Some(Generation::Legacy),
            ..Default::default()
        };
        let s = DeviceSession::open(device(40045, FaultPlan::new()), "/dev/sg0", &opts).unwrap();
        assert_eq!(s.generation(), Generation::Legacy);
    }

    #[test]
    fn test_too_old_driver() {
        let err = DeviceSession::open(device(20000, FaultPlan::new()), "/dev/sg3", &SessionOptions::default())
            .unwrap_err();
        assert!(matches!(err, SessionError::VersionTooOld { found: 20000, .. }));
    }

    #[test]
    fn test_extended_override_on_v3_driver() {
        let opts = SessionOptions {
            generation: Some(Generation::Extended),
            ..Default::default()
        };
        let err = DeviceSession::open(device(30536, FaultPlan::new()), "/dev/sg0", &opts).unwrap_err();
        assert!(matches!(
            err,
            SessionError::GenerationUnavailable {
                generation: Generation::Extended,
                required: 40000,
                ..
            }
        ));
    }

    #[test]
    fn test_feature_negotiation() {
        let opts = SessionOptions {
            ns_timing: true,
            more_async: true,
            excl_waitq: true,
            ..Default::default()
        };
        let plan = FaultPlan::new().grant_ctl_flags(SG_CTL_FLAGM_TIME_IN_NS | SG_CTL_FLAGM_EXCL_WAITQ);
        let s = DeviceSession::open(device(MEM_DEFAULT_VERSION, plan), "/dev/sg0", &opts).unwrap();
        assert!(s.features().ns_timing);
        assert!(!s.features().more_async);
        assert!(s.features().excl_waitq);
    }

    #[test]
    fn test_features_unavailable_on_legacy_driver() {
        let opts = SessionOptions {
            ns_timing: true,
            ..Default::default()
        };
        let s = DeviceSession::open(device(30536, FaultPlan::new()), "/dev/sg0", &opts).unwrap();
        assert!(!s.features().ns_timing);
        assert!(s.duration_of(&RawCompletion::default()).is_none());
    }

    #[test]
    fn test_reserved_growth() {
        let opts = SessionOptions {
            reserve_bytes: 256 * 1024,
            ..Default::default()
        };
        let s = DeviceSession::open(device(MEM_DEFAULT_VERSION, FaultPlan::new()), "/dev/sg0", &opts).unwrap();
        assert_eq!(s.reserved_size(), 256 * 1024);

        let stubborn = device(MEM_DEFAULT_VERSION, FaultPlan::new().refuse_reserved());
        let s = DeviceSession::open(stubborn, "/dev/sg0", &opts).unwrap();
        assert_eq!(s.reserved_size(), MEM_DEFAULT_RESERVED);
    }

    #[test]
    fn test_force_pack_id() {
        let opts = SessionOptions {
            force_pack_id: true,
            ..Default::default()
        };
        let s = DeviceSession::open(device(MEM_DEFAULT_VERSION, FaultPlan::new()), "/dev/sg0", &opts).unwrap();
        assert!(s.features().force_pack_id);
    }

    #[test]
    fn test_read_capacity_both_generations() {
        for version in [30536, 40045] {
            let dev = Box::new(MemDevice::with_plan(MemDisk::new(4096, 512), version, FaultPlan::new()));
            let s = DeviceSession::open(dev, "/dev/sg0", &SessionOptions::default()).unwrap();
            let cap = s.read_capacity(1, Duration::from_secs(1)).unwrap();
            assert_eq!(cap.blocks, 4096);
            assert_eq!(cap.block_size, 512);
        }
    }

    #[test]
    fn test_read_capacity_times_out() {
        let plan = FaultPlan::new().receive_always(libc::EAGAIN);
        let s = DeviceSession::open(device(MEM_DEFAULT_VERSION, plan), "/dev/sg0", &SessionOptions::default())
            .unwrap();
        let err = s.read_capacity(1, Duration::from_millis(20)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_map_reserved() {
        let mut s = DeviceSession::open(device(MEM_DEFAULT_VERSION, FaultPlan::new()), "/dev/sg0", &SessionOptions::default())
            .unwrap();
        assert!(!s.is_mapped());
        s.map_reserved(4096).unwrap();
        assert!(s.is_mapped());
        assert!(s.map_reserved(usize::MAX / 2).is_err());
    }

    #[test]
    fn test_control_error_names_device_and_call() {
        let mut s = DeviceSession::open(device(MEM_DEFAULT_VERSION, FaultPlan::new()), "/dev/sg7", &SessionOptions::default())
            .unwrap();
        let err = s.map_reserved(usize::MAX / 2).unwrap_err();
        match &err {
            SessionError::Control { path, what, .. } => {
                assert_eq!(path, "/dev/sg7");
                assert_eq!(*what, "mmap of reserved buffer");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("mmap of reserved buffer on /dev/sg7 failed"));
    }

    #[test]
    fn test_ns_duration() {
        let opts = SessionOptions {
            ns_timing: true,
            ..Default::default()
        };
        let s = DeviceSession::open(device(MEM_DEFAULT_VERSION, FaultPlan::new()), "/dev/sg0", &opts).unwrap();
        let raw = RawCompletion {
            duration: 1500,
            ..Default::default()
        };
        assert_eq!(s.duration_of(&raw), Some(Duration::from_nanos(1500)));
    }
}
