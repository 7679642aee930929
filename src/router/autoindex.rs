use std::fmt::Write;
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// HTML listing of `dir`, linked relative to `uri`.
///
/// Entries appear in the order the filesystem returns them, directories
/// with a trailing `/`. A parent link is added everywhere but at `/`.
pub fn render(dir: &Path, uri: &str) -> io::Result<String> {
    let base = if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{}/", uri)
    };
    let title = escape(&base);

    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n<body><h1>Index of {title}</h1>\n<ul>\n"
    );
    if base != "/" {
        let _ = writeln!(html, "<li><a href=\"{}../\">Parent Directory</a></li>", escape(&base));
    }

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), "failed to read directory entry: {}", e);
                continue;
            }
        };
        let mut name = entry.file_name().to_string_lossy().into_owned();
        // Follow symlinks the way stat(2) does.
        match fs::metadata(entry.path()) {
            Ok(metadata) if metadata.is_dir() => name.push('/'),
            Ok(_) => {}
            Err(e) => {
                warn!(path = %entry.path().display(), "failed to stat entry: {}", e);
                continue;
            }
        }
        let href = format!("{}{}", base, urlencoding::encode(&name).replace("%2F", "/"));
        let _ = writeln!(html, "<li><a href=\"{}\">{}</a></li>", escape(&href), escape(&name));
    }

    html.push_str("</ul>\n</body>\n</html>\n");
    Ok(html)
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
