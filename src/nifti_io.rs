//! NIfTI file I/O
//!
//! Loads masks (3D) and diffusion-weighted volumes (4D) from .nii / .nii.gz
//! files, and writes N-dimensional float32 NIfTI-1 images carrying a given
//! affine.
//!
//! An uncompressed 4D file is memory-mapped and its voxels are decoded on
//! access straight from the mapping, so the kernel pages the image in as
//! voxels are visited. Gzipped files and masks are decoded into memory.

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use memmap2::Mmap;
use ndarray::{s, Array, Array4, Ix4, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{Error, Result};

/// Size of the NIfTI-1 header in bytes
const NIFTI1_HEADER_SIZE: usize = 348;

/// Data offset: header plus the 4-byte empty extension block
const NIFTI1_VOX_OFFSET: usize = 352;

/// Maximum number of dimensions a NIfTI-1 header can describe
const NIFTI1_MAX_DIMS: usize = 7;

/// Single 3D volume loaded from a NIfTI file
pub struct NiftiData {
    /// Volume data as f64, Fortran order
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

/// On-disk voxel type of a mapped image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VoxelKind {
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl VoxelKind {
    fn from_code(datatype: i16) -> Option<Self> {
        match datatype {
            2 => Some(VoxelKind::U8),
            4 => Some(VoxelKind::I16),
            8 => Some(VoxelKind::I32),
            16 => Some(VoxelKind::F32),
            64 => Some(VoxelKind::F64),
            256 => Some(VoxelKind::I8),
            512 => Some(VoxelKind::U16),
            768 => Some(VoxelKind::U32),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            VoxelKind::U8 | VoxelKind::I8 => 1,
            VoxelKind::I16 | VoxelKind::U16 => 2,
            VoxelKind::I32 | VoxelKind::U32 | VoxelKind::F32 => 4,
            VoxelKind::F64 => 8,
        }
    }
}

fn array_of<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

macro_rules! decode {
    ($t:ty, $bytes:expr, $le:expr) => {{
        let raw = array_of($bytes);
        (if $le { <$t>::from_le_bytes(raw) } else { <$t>::from_be_bytes(raw) }) as f64
    }};
}

/// Where and how the voxels of an uncompressed NIfTI-1 file are stored
#[derive(Clone, Copy, Debug)]
struct MappedLayout {
    offset: usize,
    dims: (usize, usize, usize, usize),
    kind: VoxelKind,
    little_endian: bool,
    slope: f64,
    inter: f64,
}

/// Voxel data read through a memory map
struct MappedVolume {
    mmap: Mmap,
    layout: MappedLayout,
}

impl MappedVolume {
    /// Scaled value at Fortran linear index `linear`
    fn value(&self, linear: usize) -> f64 {
        let layout = &self.layout;
        let size = layout.kind.size();
        let start = layout.offset + linear * size;
        let bytes = &self.mmap[start..start + size];
        let le = layout.little_endian;
        let raw = match layout.kind {
            VoxelKind::U8 => bytes[0] as f64,
            VoxelKind::I8 => bytes[0] as i8 as f64,
            VoxelKind::I16 => decode!(i16, bytes, le),
            VoxelKind::U16 => decode!(u16, bytes, le),
            VoxelKind::I32 => decode!(i32, bytes, le),
            VoxelKind::U32 => decode!(u32, bytes, le),
            VoxelKind::F32 => decode!(f32, bytes, le),
            VoxelKind::F64 => decode!(f64, bytes, le),
        };
        if layout.slope != 0.0 {
            raw * layout.slope + layout.inter
        } else {
            raw
        }
    }
}

enum DwiData {
    Memory(Array4<f32>),
    Mapped(MappedVolume),
}

/// Diffusion-weighted 4D volume, indexed [x, y, z, volume]
pub struct DwiVolume {
    data: DwiData,
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

impl DwiVolume {
    /// Volume backed by an in-memory array
    pub fn from_array(data: Array4<f32>, voxel_size: (f64, f64, f64), affine: [f64; 16]) -> Self {
        Self {
            data: DwiData::Memory(data),
            voxel_size,
            affine,
        }
    }

    /// Dimensions (nx, ny, nz, N)
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        match &self.data {
            DwiData::Memory(array) => array.dim(),
            DwiData::Mapped(mapped) => mapped.layout.dims,
        }
    }

    /// Spatial dimensions (nx, ny, nz)
    pub fn spatial_dims(&self) -> (usize, usize, usize) {
        let (nx, ny, nz, _) = self.dims();
        (nx, ny, nz)
    }

    /// Number of acquired volumes (N)
    pub fn n_volumes(&self) -> usize {
        self.dims().3
    }

    /// Voxel data is read from a file mapping rather than held in memory
    pub fn is_memory_mapped(&self) -> bool {
        matches!(self.data, DwiData::Mapped(_))
    }

    /// Intensity of volume `t` at (x, y, z)
    pub fn value(&self, x: usize, y: usize, z: usize, t: usize) -> f64 {
        match &self.data {
            DwiData::Memory(array) => array[[x, y, z, t]] as f64,
            DwiData::Mapped(mapped) => {
                let (nx, ny, nz, _) = mapped.layout.dims;
                mapped.value(x + nx * (y + ny * (z + nz * t)))
            }
        }
    }

    /// Replace `out` with the N samples of voxel (x, y, z)
    pub fn signal_into(&self, x: usize, y: usize, z: usize, out: &mut Vec<f64>) {
        out.clear();
        match &self.data {
            DwiData::Memory(array) => {
                out.extend(array.slice(s![x, y, z, ..]).iter().map(|&v| v as f64));
            }
            DwiData::Mapped(mapped) => {
                let (nx, ny, nz, n) = mapped.layout.dims;
                let voxel = x + nx * (y + ny * z);
                let stride = nx * ny * nz;
                out.extend((0..n).map(|t| mapped.value(voxel + stride * t)));
            }
        }
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < NIFTI1_HEADER_SIZE {
        return format!(
            "File too small ({} bytes, need at least {})",
            bytes.len(),
            NIFTI1_HEADER_SIZE
        );
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Decode a NIfTI object, auto-detecting gzip
fn read_object(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decompressed = Vec::new();
            let info = if GzDecoder::new(Cursor::new(bytes))
                .read_to_end(&mut decompressed)
                .is_ok()
            {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            Error::Nifti(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
        })
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes)).map_err(|e| {
            Error::Nifti(format!("Failed to read NIfTI: {} ({})", e, get_header_info(bytes)))
        })
    }
}

fn voxel_size(header: &NiftiHeader) -> (f64, f64, f64) {
    (
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    )
}

/// Load a 3D NIfTI volume from bytes (a 4D file yields its first volume)
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj = read_object(bytes)?;
    let header = obj.header();

    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(Error::InvalidDimensions(format!(
            "Expected at least 3D volume, got {}D",
            ndim
        )));
    }

    let voxel_size = voxel_size(header);
    let affine = get_affine(header);

    let array: Array<f64, IxDyn> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| Error::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(Error::InvalidDimensions(format!(
            "Expected at least 3D array, got {}D",
            shape.len()
        )));
    }

    // Extract data in Fortran order (x varies fastest) to match NIfTI convention
    let (dim0, dim1, dim2) = (shape[0], shape[1], shape[2]);
    let mut data = Vec::with_capacity(dim0 * dim1 * dim2);
    for k in 0..dim2 {
        for j in 0..dim1 {
            for i in 0..dim0 {
                let mut index = vec![0usize; shape.len()];
                index[0] = i;
                index[1] = j;
                index[2] = k;
                data.push(array[IxDyn(&index)]);
            }
        }
    }

    Ok(NiftiData {
        data,
        dims: (dim0, dim1, dim2),
        voxel_size,
        affine,
    })
}

/// Decode a 4D diffusion-weighted volume from bytes into memory
pub fn load_dwi(bytes: &[u8]) -> Result<DwiVolume> {
    let obj = read_object(bytes)?;
    let header = obj.header();
    let voxel_size = voxel_size(header);
    let affine = get_affine(header);

    let array: Array<f32, IxDyn> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| Error::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    if array.ndim() != 4 {
        return Err(Error::InvalidDimensions(format!(
            "Expected a 4D diffusion volume, got {}D with shape {:?}",
            array.ndim(),
            array.shape()
        )));
    }
    let data = array
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::InvalidDimensions(e.to_string()))?;

    debug!("loaded DWI volume with shape {:?}", data.dim());

    Ok(DwiVolume::from_array(data, voxel_size, affine))
}

/// Voxel layout of an uncompressed 4D file, read from its header
///
/// `None` when the bytes are not a single-file NIfTI-1 image with a plain
/// numeric voxel type; such files are decoded in memory instead.
fn mapped_layout(bytes: &[u8]) -> Result<Option<(MappedLayout, NiftiHeader)>> {
    if bytes.len() < NIFTI1_HEADER_SIZE || &bytes[344..347] != b"n+1" {
        return Ok(None);
    }
    let little_endian = if i32::from_le_bytes(array_of(&bytes[0..4])) == NIFTI1_HEADER_SIZE as i32 {
        true
    } else if i32::from_be_bytes(array_of(&bytes[0..4])) == NIFTI1_HEADER_SIZE as i32 {
        false
    } else {
        return Ok(None);
    };

    let header = NiftiHeader::from_reader(Cursor::new(bytes)).map_err(|e| {
        Error::Nifti(format!("Failed to read NIfTI header: {} ({})", e, get_header_info(bytes)))
    })?;
    let kind = match VoxelKind::from_code(header.datatype as i16) {
        Some(kind) => kind,
        None => return Ok(None),
    };

    let ndim = header.dim[0] as usize;
    if ndim != 4 {
        return Err(Error::InvalidDimensions(format!(
            "Expected a 4D diffusion volume, got {}D",
            ndim
        )));
    }
    let dims = (
        header.dim[1] as usize,
        header.dim[2] as usize,
        header.dim[3] as usize,
        header.dim[4] as usize,
    );
    let offset = header.vox_offset as usize;
    let data_size = dims.0 * dims.1 * dims.2 * dims.3 * kind.size();
    if bytes.len() < offset + data_size {
        return Err(Error::Nifti(format!(
            "file truncated: {} bytes, header needs {}",
            bytes.len(),
            offset + data_size
        )));
    }

    let layout = MappedLayout {
        offset,
        dims,
        kind,
        little_endian,
        slope: header.scl_slope as f64,
        inter: header.scl_inter as f64,
    };
    Ok(Some((layout, header)))
}

/// Memory-map a file for reading
fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read file '{}': {}", path.display(), e),
        ))
    })?;
    // SAFETY: read-only mapping of a file that was just opened; external
    // modification during the run may corrupt the decoded values but not memory
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Read a 3D NIfTI file (.nii or .nii.gz)
pub fn read_nifti_file(path: &Path) -> Result<NiftiData> {
    let mmap = map_file(path)?;
    load_nifti(&mmap)
}

/// Read a 4D diffusion-weighted NIfTI file (.nii or .nii.gz)
///
/// Uncompressed files stay memory-mapped; gzipped files are decoded.
pub fn read_dwi_file(path: &Path) -> Result<DwiVolume> {
    let mmap = map_file(path)?;
    if is_gzip(&mmap) {
        return load_dwi(&mmap);
    }
    match mapped_layout(&mmap)? {
        Some((layout, header)) => {
            debug!("mapped DWI volume with shape {:?} ({:?})", layout.dims, layout.kind);
            Ok(DwiVolume {
                data: DwiData::Mapped(MappedVolume { mmap, layout }),
                voxel_size: voxel_size(&header),
                affine: get_affine(&header),
            })
        }
        None => load_dwi(&mmap),
    }
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let (vsx, vsy, vsz) = voxel_size(header);
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Build a float32 NIfTI-1 header for an image of shape `dims`
fn build_header(
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<[u8; NIFTI1_HEADER_SIZE]> {
    if dims.is_empty() || dims.len() > NIFTI1_MAX_DIMS {
        return Err(Error::InvalidDimensions(format!(
            "NIfTI-1 supports 1 to {} dimensions, got {}",
            NIFTI1_MAX_DIMS,
            dims.len()
        )));
    }
    if let Some(&d) = dims.iter().find(|&&d| d > i16::MAX as usize) {
        return Err(Error::InvalidDimensions(format!(
            "dimension {} exceeds the NIfTI-1 limit of {}",
            d,
            i16::MAX
        )));
    }

    let (vsx, vsy, vsz) = voxel_size;
    let mut header = [0u8; NIFTI1_HEADER_SIZE];

    header[0..4].copy_from_slice(&(NIFTI1_HEADER_SIZE as i32).to_le_bytes());

    // dim[0..7]
    let mut dim: [i16; 8] = [1; 8];
    dim[0] = dims.len() as i16;
    for (i, &d) in dims.iter().enumerate() {
        dim[i + 1] = d as i16;
    }
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    header[108..112].copy_from_slice(&(NIFTI1_VOX_OFFSET as f32).to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    Ok(header)
}

fn check_len(data: &[f32], dims: &[usize]) -> Result<()> {
    let expected: usize = dims.iter().product();
    if data.len() != expected {
        return Err(Error::InvalidDimensions(format!(
            "data has {} values but dims {:?} need {}",
            data.len(),
            dims,
            expected
        )));
    }
    Ok(())
}

/// Write a float32 NIfTI-1 image to `writer`, one 3D volume at a time
///
/// `fill(block, volume)` receives the index of each 3D volume in Fortran
/// order over `dims[3..]` and fills it x fastest. Only one volume is held
/// at a time.
pub fn write_nifti_volumes<W, F>(
    mut writer: W,
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
    mut fill: F,
) -> Result<()>
where
    W: Write,
    F: FnMut(usize, &mut [f32]),
{
    let header = build_header(dims, voxel_size, affine)?;
    writer.write_all(&header)?;
    // Extension (4 bytes, all zeros = no extension)
    writer.write_all(&[0u8; 4])?;

    let split = dims.len().min(3);
    let volume_len: usize = dims[..split].iter().product();
    let n_blocks: usize = dims[split..].iter().product();

    let mut volume = vec![0.0f32; volume_len];
    let mut bytes = Vec::with_capacity(volume_len * 4);
    for block in 0..n_blocks {
        fill(block, &mut volume);
        bytes.clear();
        for &val in &volume {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
        writer.write_all(&bytes)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a float32 NIfTI-1 image to `writer`
///
/// `data` must be in Fortran order (first axis fastest) with
/// `dims.iter().product()` elements.
pub fn write_nifti<W: Write>(
    writer: W,
    data: &[f32],
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<()> {
    check_len(data, dims)?;
    write_nifti_volumes(writer, dims, voxel_size, affine, |block, volume| {
        let start = block * volume.len();
        volume.copy_from_slice(&data[start..start + volume.len()]);
    })
}

/// Stream a float32 image to a file, one 3D volume at a time
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn save_nifti_volumes_to_file<F>(
    path: &Path,
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
    fill: F,
) -> Result<()>
where
    F: FnMut(usize, &mut [f32]),
{
    let file = File::create(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to write file '{}': {}", path.display(), e),
        ))
    })?;
    let writer = BufWriter::new(file);

    if path.to_string_lossy().ends_with(".nii.gz") {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        write_nifti_volumes(&mut encoder, dims, voxel_size, affine, fill)?;
        encoder.finish()?.flush()?;
    } else {
        write_nifti_volumes(writer, dims, voxel_size, affine, fill)?;
    }
    Ok(())
}

/// Save NIfTI data to a file (gzip when the path ends with .nii.gz)
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f32],
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<()> {
    check_len(data, dims)?;
    save_nifti_volumes_to_file(path, dims, voxel_size, affine, |block, volume| {
        let start = block * volume.len();
        volume.copy_from_slice(&data[start..start + volume.len()]);
    })
}
