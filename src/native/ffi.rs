//! C ABI of the engine module and the [`Engine`] implementation over it.

use std::ffi::{c_char, c_float, c_int, c_void, CString};

use libloading::Library;

use crate::config::EngineConfig;
use crate::engine::{
    Engine, Img2ImgRequest, RawContext, RawImage, Schedule, Txt2ImgRequest, WeightType,
};
use crate::logging::{forward_native_log, LogLevel};
use crate::pixel::PixelBuffer;

/// Image as laid out by the engine.
#[repr(C)]
#[derive(Debug)]
pub struct SdImage {
    pub width: u32,
    pub height: u32,
    pub channel: u32,
    pub data: *mut u8,
}

pub type NativeLogFn =
    extern "C" fn(level: c_int, file: *const c_char, line: c_int, text: *const c_char, data: *mut c_void);

type CtxNewFn = unsafe extern "C" fn(
    n_threads: c_int,
    vae_decode_only: bool,
    taesd_path: *const c_char,
    esrgan_path: *const c_char,
    free_params_immediately: bool,
    vae_tiling: bool,
    lora_model_dir: *const c_char,
    rng_type: c_int,
) -> *mut c_void;
type CtxFreeFn = unsafe extern "C" fn(ctx: *mut c_void);
type LoadFromFileFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    model_path: *const c_char,
    vae_path: *const c_char,
    wtype: c_int,
    schedule: c_int,
) -> bool;
type Txt2ImgFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    prompt: *const c_char,
    negative_prompt: *const c_char,
    cfg_scale: c_float,
    width: c_int,
    height: c_int,
    sample_method: c_int,
    sample_steps: c_int,
    seed: i64,
    batch_count: c_int,
) -> *mut SdImage;
type Img2ImgFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    init_image: SdImage,
    prompt: *const c_char,
    negative_prompt: *const c_char,
    cfg_scale: c_float,
    width: c_int,
    height: c_int,
    sample_method: c_int,
    sample_steps: c_int,
    strength: c_float,
    seed: i64,
) -> *mut SdImage;
type ImagesFreeFn = unsafe extern "C" fn(images: *mut SdImage, count: c_int);
type SetLogCallbackFn = unsafe extern "C" fn(callback: Option<NativeLogFn>, data: *mut c_void);
type SetLogLevelFn = unsafe extern "C" fn(level: c_int);

/// Entry points resolved from a loaded engine module.
///
/// The function pointers are only valid while `_library` stays loaded, which
/// is for the lifetime of this value.
pub struct NativeEngine {
    ctx_new: CtxNewFn,
    ctx_free: CtxFreeFn,
    load_from_file: LoadFromFileFn,
    txt2img: Txt2ImgFn,
    img2img: Img2ImgFn,
    images_free: ImagesFreeFn,
    set_log_callback: SetLogCallbackFn,
    set_log_level: SetLogLevelFn,
    _library: Library,
}

impl NativeEngine {
    /// Resolves every engine symbol from `library`.
    pub fn from_library(library: Library) -> Result<Self, libloading::Error> {
        // SAFETY: the symbol types mirror the engine's exported C declarations.
        let ctx_new = unsafe { *library.get::<CtxNewFn>(b"sd_ctx_new\0")? };
        let ctx_free = unsafe { *library.get::<CtxFreeFn>(b"sd_ctx_free\0")? };
        let load_from_file = unsafe { *library.get::<LoadFromFileFn>(b"sd_load_from_file\0")? };
        let txt2img = unsafe { *library.get::<Txt2ImgFn>(b"sd_txt2img\0")? };
        let img2img = unsafe { *library.get::<Img2ImgFn>(b"sd_img2img\0")? };
        let images_free = unsafe { *library.get::<ImagesFreeFn>(b"sd_images_free\0")? };
        let set_log_callback =
            unsafe { *library.get::<SetLogCallbackFn>(b"sd_set_log_callback\0")? };
        let set_log_level = unsafe { *library.get::<SetLogLevelFn>(b"sd_set_log_level\0")? };

        Ok(Self {
            ctx_new,
            ctx_free,
            load_from_file,
            txt2img,
            img2img,
            images_free,
            set_log_callback,
            set_log_level,
            _library: library,
        })
    }

    /// Copies `count` images out of engine memory and releases the array.
    ///
    /// # Safety
    ///
    /// `images` must be null or an array of `count` images returned by this
    /// engine and not yet released.
    unsafe fn take_images(&self, images: *mut SdImage, count: usize) -> Option<Vec<RawImage>> {
        if images.is_null() {
            return None;
        }
        let copied = std::slice::from_raw_parts(images, count)
            .iter()
            .map(|image| {
                if image.data.is_null() {
                    return None;
                }
                let len = image.width as usize * image.height as usize * image.channel as usize;
                Some(RawImage {
                    width: image.width,
                    height: image.height,
                    channels: image.channel,
                    data: std::slice::from_raw_parts(image.data, len).to_vec(),
                })
            })
            .collect::<Option<Vec<_>>>();
        (self.images_free)(images, count as c_int);
        copied
    }
}

fn c_string(field: &str, value: &str) -> Option<CString> {
    match CString::new(value) {
        Ok(s) => Some(s),
        Err(_) => {
            tracing::warn!(field, "string contains an interior NUL byte");
            None
        }
    }
}

/// `EngineHandle` rejects values above `c_int::MAX` before they get here.
fn c_int_of(value: u32) -> c_int {
    c_int::try_from(value).unwrap_or(c_int::MAX)
}

impl Engine for NativeEngine {
    fn new_context(&self, config: &EngineConfig) -> Option<RawContext> {
        let taesd = c_string("taesd_path", &config.taesd_path)?;
        let esrgan = c_string("esrgan_path", &config.esrgan_path)?;
        let lora_dir = c_string("lora_model_dir", &config.lora_model_dir)?;
        // SAFETY: the strings outlive the call; ownership of the returned
        // context passes to the RawContext.
        unsafe {
            let ptr = (self.ctx_new)(
                config.threads,
                config.vae_decode_only,
                taesd.as_ptr(),
                esrgan.as_ptr(),
                config.free_params_immediately,
                config.vae_tiling,
                lora_dir.as_ptr(),
                config.rng.code(),
            );
            RawContext::from_raw(ptr)
        }
    }

    fn free_context(&self, context: RawContext) {
        // SAFETY: RawContext is move-only, so this is the single release.
        unsafe { (self.ctx_free)(context.into_raw()) }
    }

    fn load_from_file(
        &self,
        context: &RawContext,
        model_path: &str,
        vae_path: &str,
        weight_type: WeightType,
        schedule: Schedule,
    ) -> bool {
        let (Some(model), Some(vae)) = (c_string("model_path", model_path), c_string("vae_path", vae_path))
        else {
            return false;
        };
        // SAFETY: the context is live for the borrow; strings outlive the call.
        unsafe {
            (self.load_from_file)(
                context.as_ptr(),
                model.as_ptr(),
                vae.as_ptr(),
                weight_type.code(),
                schedule.code(),
            )
        }
    }

    fn txt2img(&self, context: &RawContext, request: &Txt2ImgRequest) -> Option<Vec<RawImage>> {
        let prompt = c_string("prompt", &request.prompt)?;
        let negative = c_string("negative_prompt", &request.negative_prompt)?;
        // SAFETY: the context is live for the borrow; the returned array holds
        // batch_count images.
        unsafe {
            let images = (self.txt2img)(
                context.as_ptr(),
                prompt.as_ptr(),
                negative.as_ptr(),
                request.cfg_scale,
                c_int_of(request.width),
                c_int_of(request.height),
                request.sample_method.code(),
                c_int_of(request.sample_steps),
                request.seed,
                c_int_of(request.batch_count),
            );
            self.take_images(images, request.batch_count as usize)
        }
    }

    fn img2img(
        &self,
        context: &RawContext,
        source: &PixelBuffer,
        request: &Img2ImgRequest,
    ) -> Option<Vec<RawImage>> {
        let prompt = c_string("prompt", &request.prompt)?;
        let negative = c_string("negative_prompt", &request.negative_prompt)?;
        let init_image = SdImage {
            width: source.width(),
            height: source.height(),
            channel: source.channels() as u32,
            // The engine only reads the init image.
            data: source.bytes().as_ptr() as *mut u8,
        };
        // SAFETY: `source` outlives the call; the returned array holds one image.
        unsafe {
            let images = (self.img2img)(
                context.as_ptr(),
                init_image,
                prompt.as_ptr(),
                negative.as_ptr(),
                request.cfg_scale,
                c_int_of(request.width),
                c_int_of(request.height),
                request.sample_method.code(),
                c_int_of(request.sample_steps),
                request.strength,
                request.seed,
            );
            self.take_images(images, 1)
        }
    }

    fn set_log_level(&self, level: LogLevel) {
        // SAFETY: plain integer argument.
        unsafe { (self.set_log_level)(level.code()) }
    }

    fn set_log_callback(&self, enabled: bool) {
        let callback: Option<NativeLogFn> = if enabled {
            Some(forward_native_log)
        } else {
            None
        };
        // SAFETY: `forward_native_log` never unwinds and ignores `data`.
        unsafe { (self.set_log_callback)(callback, std::ptr::null_mut()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd_image_matches_c_layout() {
        assert_eq!(std::mem::align_of::<SdImage>(), std::mem::align_of::<*mut u8>());
        assert_eq!(
            std::mem::size_of::<SdImage>(),
            if std::mem::size_of::<*mut u8>() == 8 { 24 } else { 16 }
        );
    }

    #[test]
    fn interior_nul_is_refused() {
        assert!(c_string("prompt", "a\0b").is_none());
        assert!(c_string("prompt", "a lovely cat").is_some());
    }

    #[test]
    fn oversized_dimensions_saturate() {
        assert_eq!(c_int_of(512), 512);
        assert_eq!(c_int_of(u32::MAX), c_int::MAX);
    }
}
