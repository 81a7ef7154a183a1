//! In-process engine used by unit tests.
//!
//! Counts every boundary call and tracks live contexts, so tests can assert
//! that a context is released exactly once and that rejected arguments never
//! reach the engine.

use std::collections::HashSet;
use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::EngineConfig;
use crate::logging::LogLevel;
use crate::pixel::{ChannelOrder, PixelBuffer};

use super::params::{Schedule, WeightType};
use super::request::{Img2ImgRequest, Txt2ImgRequest};
use super::{Engine, RawContext, RawImage};

#[derive(Default)]
pub(crate) struct MockEngine {
    fail_new_context: bool,
    fail_generation: bool,
    next_id: AtomicUsize,
    live: Mutex<HashSet<usize>>,
    created: AtomicUsize,
    freed: AtomicUsize,
    loads: AtomicUsize,
    txt2img: AtomicUsize,
    img2img: AtomicUsize,
    log_toggles: AtomicUsize,
    log_callback: AtomicBool,
    log_level: Mutex<Option<LogLevel>>,
    last_img2img_order: Mutex<Option<ChannelOrder>>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every `new_context` call returns null.
    pub(crate) fn failing_new_context(mut self) -> Self {
        self.fail_new_context = true;
        self
    }

    /// Every generation call returns null.
    pub(crate) fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    pub(crate) fn live_contexts(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub(crate) fn frees(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub(crate) fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn txt2img_calls(&self) -> usize {
        self.txt2img.load(Ordering::SeqCst)
    }

    pub(crate) fn img2img_calls(&self) -> usize {
        self.img2img.load(Ordering::SeqCst)
    }

    pub(crate) fn log_toggles(&self) -> usize {
        self.log_toggles.load(Ordering::SeqCst)
    }

    pub(crate) fn log_callback_enabled(&self) -> bool {
        self.log_callback.load(Ordering::SeqCst)
    }

    pub(crate) fn log_level(&self) -> Option<LogLevel> {
        *self.log_level.lock().unwrap()
    }

    pub(crate) fn last_img2img_order(&self) -> Option<ChannelOrder> {
        *self.last_img2img_order.lock().unwrap()
    }

    /// Total calls that crossed the boundary.
    pub(crate) fn native_calls(&self) -> usize {
        self.created.load(Ordering::SeqCst)
            + self.frees()
            + self.load_calls()
            + self.txt2img_calls()
            + self.img2img_calls()
            + self.log_toggles()
    }

    fn image(width: u32, height: u32, fill: u8) -> RawImage {
        RawImage {
            width,
            height,
            channels: 3,
            data: vec![fill; width as usize * height as usize * 3],
        }
    }
}

impl Engine for MockEngine {
    fn new_context(&self, _config: &EngineConfig) -> Option<RawContext> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_new_context {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(id);
        let ptr = Box::into_raw(Box::new(id)) as *mut c_void;
        unsafe { RawContext::from_raw(ptr) }
    }

    fn free_context(&self, context: RawContext) {
        self.freed.fetch_add(1, Ordering::SeqCst);
        let id = unsafe { Box::from_raw(context.into_raw() as *mut usize) };
        assert!(self.live.lock().unwrap().remove(&*id), "context {} freed twice", id);
    }

    fn load_from_file(
        &self,
        _context: &RawContext,
        model_path: &str,
        _vae_path: &str,
        _weight_type: WeightType,
        _schedule: Schedule,
    ) -> bool {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Path::new(model_path).is_file()
    }

    fn txt2img(&self, _context: &RawContext, request: &Txt2ImgRequest) -> Option<Vec<RawImage>> {
        self.txt2img.fetch_add(1, Ordering::SeqCst);
        if self.fail_generation {
            return None;
        }
        Some(
            (0..request.batch_count)
                .map(|i| Self::image(request.width, request.height, i as u8))
                .collect(),
        )
    }

    fn img2img(
        &self,
        _context: &RawContext,
        source: &PixelBuffer,
        request: &Img2ImgRequest,
    ) -> Option<Vec<RawImage>> {
        self.img2img.fetch_add(1, Ordering::SeqCst);
        *self.last_img2img_order.lock().unwrap() = Some(source.channel_order());
        if self.fail_generation {
            return None;
        }
        Some(vec![Self::image(request.width, request.height, 0x80)])
    }

    fn set_log_level(&self, level: LogLevel) {
        *self.log_level.lock().unwrap() = Some(level);
    }

    fn set_log_callback(&self, enabled: bool) {
        self.log_toggles.fetch_add(1, Ordering::SeqCst);
        self.log_callback.store(enabled, Ordering::SeqCst);
    }
}
