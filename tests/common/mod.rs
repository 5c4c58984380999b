//! Shared fixtures for batch tests.

#![allow(dead_code)]

use guided_integration::engine::{IntegrationEngine, IntegrationRequest, Pattern};
use guided_integration::error::EngineError;
use guided_integration::model::{BatchControl, BatchEvent};
use guided_integration::params::{Facility, ParameterSet};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Image contents the fake engine refuses to integrate.
pub const CORRUPT: &[u8] = b"corrupt";

/// Engine that turns the byte length of an image into a tiny pattern.
#[derive(Default)]
pub struct FakeEngine {
    calls: Cell<usize>,
    /// After the n-th integration, delete this file.
    delete_after: RefCell<Option<(usize, PathBuf)>>,
    /// After the n-th integration, send this control message.
    control_after: RefCell<Option<(usize, UnboundedSender<BatchControl>)>>,
}

impl FakeEngine {
    pub fn deleting_after(n: usize, path: &Path) -> Self {
        let engine = Self::default();
        *engine.delete_after.borrow_mut() = Some((n, path.to_path_buf()));
        engine
    }

    pub fn cancelling_after(n: usize, tx: UnboundedSender<BatchControl>) -> Self {
        let engine = Self::default();
        *engine.control_after.borrow_mut() = Some((n, tx));
        engine
    }
}

impl IntegrationEngine for FakeEngine {
    type Geometry = ();
    type Mask = ();

    fn load_geometry(&self, calibration: &Path) -> Result<(), EngineError> {
        fs::metadata(calibration)
            .map(|_| ())
            .map_err(|source| EngineError::Unreadable {
                path: calibration.to_path_buf(),
                source,
            })
    }

    fn load_mask(&self, mask: &Path) -> Result<(), EngineError> {
        self.load_geometry(mask)
    }

    fn integrate(
        &self,
        image: &Path,
        _: &(),
        _: &(),
        request: &IntegrationRequest,
    ) -> Result<Pattern, EngineError> {
        self.calls.set(self.calls.get() + 1);
        let n = self.calls.get();
        if let Some((after, path)) = self.delete_after.borrow().as_ref() {
            if n == *after {
                fs::remove_file(path).unwrap();
            }
        }
        if let Some((after, tx)) = self.control_after.borrow().as_ref() {
            if n == *after {
                tx.send(BatchControl::Cancel).unwrap();
            }
        }

        let bytes = fs::read(image).map_err(|source| EngineError::Unreadable {
            path: image.to_path_buf(),
            source,
        })?;
        if bytes == CORRUPT {
            return Err(EngineError::InvalidImage {
                path: image.to_path_buf(),
                reason: "not a TIFF".into(),
            });
        }
        let points = request.radial_points.min(4);
        let radial: Vec<f64> = (0..points).map(|i| i as f64).collect();
        let intensity = vec![bytes.len() as f64; points];
        let sigma = Some(vec![1.0; points]);
        Pattern::new(radial, intensity, sigma)
    }
}

/// A temporary beamtime: calibration, mask and an output root.
pub struct Beamtime {
    pub dir: TempDir,
    pub params: ParameterSet,
}

impl Beamtime {
    pub fn new(facility: Facility) -> Self {
        let dir = TempDir::new().unwrap();
        let cal = dir.path().join("calib");
        fs::create_dir(&cal).unwrap();
        let poni = cal.join("LaB6.poni");
        let mask = cal.join("mask.tif");
        fs::write(&poni, "Distance: 0.25\n").unwrap();
        fs::write(&mask, b"II*\0").unwrap();
        let params = ParameterSet::with_defaults(facility, dir.path().join("1D"), poni, mask);
        Self { dir, params }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Write an image at `rel` with the given contents.
    pub fn image(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn record_path(&self) -> PathBuf {
        self.path("run.rec")
    }
}

pub fn channels() -> (
    UnboundedSender<BatchEvent>,
    UnboundedReceiver<BatchEvent>,
    UnboundedSender<BatchControl>,
    UnboundedReceiver<BatchControl>,
) {
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    (evt_tx, evt_rx, ctrl_tx, ctrl_rx)
}

pub fn drain(mut rx: UnboundedReceiver<BatchEvent>) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}
