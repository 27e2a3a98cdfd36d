//! DXGI desktop duplication capture (Windows).
//!
//! Pull-with-timeout: `AcquireNextFrame` blocks up to 100 ms for a changed
//! desktop frame. A timeout is reported as `Captured::NoFrameYet`, never an
//! error; on a static desktop that is the common case.

use tracing::{debug, info};
use windows::core::ComInterface;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_FLAG, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIDevice, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
    DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO,
};

use crate::capture::{CaptureBackend, Captured};
use crate::codec::{JpegCompressor, PixelFormat};
use crate::config::EncoderConfig;
use crate::error::CaptureError;

/// How long AcquireNextFrame waits for a changed frame.
const ACQUIRE_TIMEOUT_MS: u32 = 100;

pub struct DxgiBackend {
    width: u32,
    height: u32,
    device: Option<ID3D11Device>,
    context: Option<ID3D11DeviceContext>,
    duplication: Option<IDXGIOutputDuplication>,
    staging: Option<ID3D11Texture2D>,
    compressor: JpegCompressor,
    raw: Vec<u8>,
    /// Row pitch of the last mapped staging texture.
    stride: usize,
}

impl DxgiBackend {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            width: 0,
            height: 0,
            device: None,
            context: None,
            duplication: None,
            staging: None,
            compressor: JpegCompressor::new(config.quality),
            raw: Vec::new(),
            stride: 0,
        }
    }

    fn create_device() -> windows::core::Result<(ID3D11Device, ID3D11DeviceContext)> {
        let mut device = None;
        let mut context = None;
        let mut level = D3D_FEATURE_LEVEL::default();
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                Some(&mut level),
                Some(&mut context),
            )?;
        }
        match (device, context) {
            (Some(d), Some(c)) => Ok((d, c)),
            _ => Err(windows::core::Error::from_win32()),
        }
    }

    /// Copy the acquired desktop texture through the staging texture into
    /// `self.raw`, row pitch preserved.
    fn read_back(&mut self, resource: &IDXGIResource) -> Result<(), CaptureError> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| CaptureError::backend("capture called before initialize"))?;
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| CaptureError::backend("staging texture missing"))?;

        unsafe {
            let texture: ID3D11Texture2D = resource
                .cast()
                .map_err(|e| CaptureError::backend(format!("frame is not a texture: {e}")))?;
            context.CopyResource(staging, &texture);

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            context
                .Map(staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| CaptureError::backend(format!("Map failed: {e}")))?;

            self.stride = mapped.RowPitch as usize;
            let len = self.stride * self.height as usize;
            self.raw.clear();
            self.raw
                .extend_from_slice(std::slice::from_raw_parts(mapped.pData as *const u8, len));

            context.Unmap(staging, 0);
        }
        Ok(())
    }
}

impl CaptureBackend for DxgiBackend {
    fn name(&self) -> &'static str {
        "dxgi"
    }

    fn is_available(&self) -> bool {
        // Duplication needs a hardware D3D11 device; a trial creation is the
        // cheapest honest probe.
        Self::create_device().is_ok()
    }

    fn initialize(&mut self, monitor: u32) -> Result<(u32, u32), CaptureError> {
        let (device, context) = Self::create_device()
            .map_err(|e| CaptureError::backend(format!("D3D11 device creation failed: {e}")))?;

        let duplication = unsafe {
            let dxgi_device: IDXGIDevice = device
                .cast()
                .map_err(|e| CaptureError::backend(format!("no DXGI device: {e}")))?;
            let adapter = dxgi_device
                .GetAdapter()
                .map_err(|e| CaptureError::backend(format!("no DXGI adapter: {e}")))?;
            let output = adapter.EnumOutputs(monitor).map_err(|_| {
                CaptureError::no_display(format!("monitor {monitor} does not exist"))
            })?;
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| CaptureError::backend(format!("no IDXGIOutput1: {e}")))?;

            let desc = output
                .GetDesc()
                .map_err(|e| CaptureError::backend(format!("GetDesc failed: {e}")))?;
            let rect = desc.DesktopCoordinates;
            self.width = (rect.right - rect.left) as u32;
            self.height = (rect.bottom - rect.top) as u32;

            output1
                .DuplicateOutput(&device)
                .map_err(|e| CaptureError::backend(format!("DuplicateOutput failed: {e}")))?
        };

        let staging = unsafe {
            let desc = D3D11_TEXTURE2D_DESC {
                Width: self.width,
                Height: self.height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut texture = None;
            device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(|e| CaptureError::backend(format!("staging texture failed: {e}")))?;
            texture.ok_or_else(|| CaptureError::backend("staging texture missing"))?
        };

        self.device = Some(device);
        self.context = Some(context);
        self.duplication = Some(duplication);
        self.staging = Some(staging);

        info!(
            "dxgi capture initialized: {}x{}, monitor {monitor}",
            self.width, self.height
        );
        Ok((self.width, self.height))
    }

    fn capture(&mut self) -> Result<Captured<'_>, CaptureError> {
        let duplication = self
            .duplication
            .as_ref()
            .ok_or_else(|| CaptureError::backend("capture called before initialize"))?
            .clone();

        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let acquired =
            unsafe { duplication.AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut info, &mut resource) };
        if let Err(e) = acquired {
            if e.code() == DXGI_ERROR_WAIT_TIMEOUT {
                debug!("no desktop change within {ACQUIRE_TIMEOUT_MS} ms");
                return Ok(Captured::NoFrameYet);
            }
            return Err(CaptureError::backend(format!(
                "AcquireNextFrame failed: {e}"
            )));
        }

        let resource =
            resource.ok_or_else(|| CaptureError::backend("AcquireNextFrame gave no resource"))?;
        let read = self.read_back(&resource);
        drop(resource);
        unsafe {
            // Always release, even when the read back failed.
            let _ = duplication.ReleaseFrame();
        }
        read?;

        let jpeg = self.compressor.compress(
            &self.raw,
            self.width,
            self.height,
            self.stride,
            PixelFormat::Bgra8,
        )?;
        Ok(Captured::Frame(jpeg))
    }

    fn shutdown(&mut self) {
        self.staging = None;
        self.duplication = None;
        self.context = None;
        self.device = None;
        self.raw = Vec::new();
    }
}
