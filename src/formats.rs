//! Document format detection for the types Dangerzone can convert.
//!
//! Detection combines magic bytes, the server's MIME type and the file
//! extension, in decreasing order of trust.

use serde::Serialize;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Bytes read from the start of a file for magic detection.
pub const HEADER_LEN: usize = 4096;

/// Confidence assigned to each detection source.
pub const MAGIC_CONFIDENCE: f32 = 0.9;
pub const MIME_CONFIDENCE: f32 = 0.7;
pub const EXTENSION_CONFIDENCE: f32 = 0.3;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedFormat {
    Pdf,
    Doc,
    Docx,
    Xls,
    Xlsx,
    Ppt,
    Pptx,
    Odt,
    Ods,
    Odp,
    Odg,
    Rtf,
    Epub,
    Hwp,
    Hwpx,
    Jpeg,
    Png,
    Gif,
    Tiff,
    Bmp,
    Svg,
    Webp,
}

/// Static description of one format.
#[derive(Debug)]
pub struct FormatInfo {
    pub format: SupportedFormat,
    pub mime_types: &'static [&'static str],
    pub extensions: &'static [&'static str],
    pub magic: &'static [&'static [u8]],
    pub description: &'static str,
}

const FORMATS: &[FormatInfo] = &[
    FormatInfo {
        format: SupportedFormat::Pdf,
        mime_types: &["application/pdf"],
        extensions: &["pdf"],
        magic: &[b"%PDF"],
        description: "Portable Document Format",
    },
    FormatInfo {
        format: SupportedFormat::Docx,
        mime_types: &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
        extensions: &["docx"],
        magic: &[ZIP_MAGIC],
        description: "Microsoft Word Document",
    },
    FormatInfo {
        format: SupportedFormat::Doc,
        mime_types: &["application/msword"],
        extensions: &["doc"],
        magic: &[OLE_MAGIC],
        description: "Microsoft Word Document (legacy)",
    },
    FormatInfo {
        format: SupportedFormat::Xlsx,
        mime_types: &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"],
        extensions: &["xlsx"],
        magic: &[ZIP_MAGIC],
        description: "Microsoft Excel Spreadsheet",
    },
    FormatInfo {
        format: SupportedFormat::Xls,
        mime_types: &["application/vnd.ms-excel"],
        extensions: &["xls"],
        magic: &[OLE_MAGIC],
        description: "Microsoft Excel Spreadsheet (legacy)",
    },
    FormatInfo {
        format: SupportedFormat::Pptx,
        mime_types: &["application/vnd.openxmlformats-officedocument.presentationml.presentation"],
        extensions: &["pptx"],
        magic: &[ZIP_MAGIC],
        description: "Microsoft PowerPoint Presentation",
    },
    FormatInfo {
        format: SupportedFormat::Ppt,
        mime_types: &["application/vnd.ms-powerpoint"],
        extensions: &["ppt"],
        magic: &[OLE_MAGIC],
        description: "Microsoft PowerPoint Presentation (legacy)",
    },
    FormatInfo {
        format: SupportedFormat::Odt,
        mime_types: &["application/vnd.oasis.opendocument.text"],
        extensions: &["odt"],
        magic: &[ZIP_MAGIC],
        description: "OpenDocument Text",
    },
    FormatInfo {
        format: SupportedFormat::Ods,
        mime_types: &["application/vnd.oasis.opendocument.spreadsheet"],
        extensions: &["ods"],
        magic: &[ZIP_MAGIC],
        description: "OpenDocument Spreadsheet",
    },
    FormatInfo {
        format: SupportedFormat::Odp,
        mime_types: &["application/vnd.oasis.opendocument.presentation"],
        extensions: &["odp"],
        magic: &[ZIP_MAGIC],
        description: "OpenDocument Presentation",
    },
    FormatInfo {
        format: SupportedFormat::Odg,
        mime_types: &["application/vnd.oasis.opendocument.graphics"],
        extensions: &["odg"],
        magic: &[ZIP_MAGIC],
        description: "OpenDocument Graphics",
    },
    FormatInfo {
        format: SupportedFormat::Rtf,
        mime_types: &["application/rtf", "text/rtf"],
        extensions: &["rtf"],
        magic: &[b"{\\rtf"],
        description: "Rich Text Format",
    },
    FormatInfo {
        format: SupportedFormat::Epub,
        mime_types: &["application/epub+zip"],
        extensions: &["epub"],
        magic: &[ZIP_MAGIC],
        description: "Electronic Publication",
    },
    FormatInfo {
        format: SupportedFormat::Hwp,
        mime_types: &["application/x-hwp"],
        extensions: &["hwp"],
        magic: &[b"HWP Document File"],
        description: "Hancom Office Document",
    },
    FormatInfo {
        format: SupportedFormat::Hwpx,
        mime_types: &["application/hwp+zip"],
        extensions: &["hwpx"],
        magic: &[ZIP_MAGIC],
        description: "Hancom Office Document (XML)",
    },
    FormatInfo {
        format: SupportedFormat::Jpeg,
        mime_types: &["image/jpeg", "image/jpg"],
        extensions: &["jpg", "jpeg"],
        magic: &[b"\xff\xd8\xff"],
        description: "JPEG Image",
    },
    FormatInfo {
        format: SupportedFormat::Png,
        mime_types: &["image/png"],
        extensions: &["png"],
        magic: &[b"\x89PNG\r\n\x1a\n"],
        description: "PNG Image",
    },
    FormatInfo {
        format: SupportedFormat::Gif,
        mime_types: &["image/gif"],
        extensions: &["gif"],
        magic: &[b"GIF87a", b"GIF89a"],
        description: "GIF Image",
    },
    FormatInfo {
        format: SupportedFormat::Tiff,
        mime_types: &["image/tiff"],
        extensions: &["tif", "tiff"],
        magic: &[b"II*\x00", b"MM\x00*"],
        description: "TIFF Image",
    },
    FormatInfo {
        format: SupportedFormat::Bmp,
        mime_types: &["image/bmp"],
        extensions: &["bmp"],
        magic: &[b"BM"],
        description: "Bitmap Image",
    },
    FormatInfo {
        format: SupportedFormat::Svg,
        mime_types: &["image/svg+xml"],
        extensions: &["svg"],
        magic: &[b"<?xml", b"<svg"],
        description: "Scalable Vector Graphics",
    },
    FormatInfo {
        format: SupportedFormat::Webp,
        mime_types: &["image/webp"],
        extensions: &["webp"],
        magic: &[b"RIFF"],
        description: "WebP Image",
    },
];

impl SupportedFormat {
    pub fn info(self) -> &'static FormatInfo {
        // Every variant has exactly one table entry (checked in tests)
        FORMATS
            .iter()
            .find(|info| info.format == self)
            .unwrap_or(&FORMATS[0])
    }

    pub fn description(self) -> &'static str {
        self.info().description
    }

    /// Preferred file extension, without the dot.
    pub fn extension(self) -> &'static str {
        self.info().extensions[0]
    }
}

impl fmt::Display for SupportedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Detects document formats from content, MIME type and file name.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTypeDetector;

impl FileTypeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Format from the leading bytes of a file.
    pub fn detect_from_header(&self, header: &[u8]) -> Option<SupportedFormat> {
        if header.starts_with(ZIP_MAGIC) {
            return Some(detect_zip_based(header));
        }
        if header.starts_with(OLE_MAGIC) {
            // Telling DOC/XLS/PPT apart needs the OLE directory
            return Some(SupportedFormat::Doc);
        }
        if header.starts_with(b"RIFF") {
            return (header.len() >= 12 && &header[8..12] == b"WEBP")
                .then_some(SupportedFormat::Webp);
        }

        FORMATS
            .iter()
            .find(|info| info.magic.iter().any(|m| header.starts_with(m)))
            .map(|info| info.format)
    }

    /// Formats registered for a MIME type. Parameters (`; charset=...`)
    /// are ignored.
    pub fn detect_from_mime_type(&self, mime_type: &str) -> Vec<SupportedFormat> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        FORMATS
            .iter()
            .filter(|info| info.mime_types.contains(&mime.as_str()))
            .map(|info| info.format)
            .collect()
    }

    /// Formats registered for the extension of `filename`.
    pub fn detect_from_extension(&self, filename: &str) -> Vec<SupportedFormat> {
        let Some(ext) = Path::new(filename).extension().and_then(|e| e.to_str()) else {
            return Vec::new();
        };
        let ext = ext.to_lowercase();
        FORMATS
            .iter()
            .filter(|info| info.extensions.contains(&ext.as_str()))
            .map(|info| info.format)
            .collect()
    }

    /// Best guess from whatever is known, with its confidence (0.0 to 1.0).
    pub fn detect_format(
        &self,
        header: Option<&[u8]>,
        mime_type: Option<&str>,
        filename: Option<&str>,
    ) -> (Option<SupportedFormat>, f32) {
        let mut best: Option<(SupportedFormat, f32)> = None;
        let mut consider = |format: SupportedFormat, confidence: f32| {
            if best.is_none_or(|(_, c)| confidence > c) {
                best = Some((format, confidence));
            }
        };

        if let Some(format) = header.and_then(|h| self.detect_from_header(h)) {
            consider(format, MAGIC_CONFIDENCE);
        }
        for format in mime_type.map(|m| self.detect_from_mime_type(m)).unwrap_or_default() {
            consider(format, MIME_CONFIDENCE);
        }
        for format in filename.map(|f| self.detect_from_extension(f)).unwrap_or_default() {
            consider(format, EXTENSION_CONFIDENCE);
        }

        match best {
            Some((format, confidence)) => (Some(format), confidence),
            None => (None, 0.0),
        }
    }

    pub fn is_supported(
        &self,
        header: Option<&[u8]>,
        mime_type: Option<&str>,
        filename: Option<&str>,
    ) -> bool {
        let (format, confidence) = self.detect_format(header, mime_type, filename);
        format.is_some() && confidence > 0.0
    }

    /// Detect the format of a file on disk from its content and name.
    pub fn detect_file(&self, path: &Path) -> std::io::Result<(Option<SupportedFormat>, f32)> {
        let header = read_header(path)?;
        let name = path.file_name().and_then(|n| n.to_str());
        Ok(self.detect_format(Some(&header), None, name))
    }

    /// All extensions Dangerzone accepts, sorted.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut exts: Vec<_> = FORMATS
            .iter()
            .flat_map(|info| info.extensions.iter().copied())
            .collect();
        exts.sort_unstable();
        exts.dedup();
        exts
    }
}

/// First `HEADER_LEN` bytes of a file.
pub fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header)?;
    Ok(header)
}

/// Narrow a ZIP container using the entry names and the ODF/EPUB
/// `mimetype` member, which both appear near the start of the archive.
fn detect_zip_based(header: &[u8]) -> SupportedFormat {
    const MARKERS: &[(&[u8], SupportedFormat)] = &[
        (b"application/epub+zip", SupportedFormat::Epub),
        (b"application/hwp+zip", SupportedFormat::Hwpx),
        (b"application/vnd.oasis.opendocument.text", SupportedFormat::Odt),
        (b"application/vnd.oasis.opendocument.spreadsheet", SupportedFormat::Ods),
        (b"application/vnd.oasis.opendocument.presentation", SupportedFormat::Odp),
        (b"application/vnd.oasis.opendocument.graphics", SupportedFormat::Odg),
        (b"word/", SupportedFormat::Docx),
        (b"xl/", SupportedFormat::Xlsx),
        (b"ppt/", SupportedFormat::Pptx),
    ];

    MARKERS
        .iter()
        .find(|(marker, _)| contains(header, marker))
        .map(|(_, format)| *format)
        .unwrap_or(SupportedFormat::Docx)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
