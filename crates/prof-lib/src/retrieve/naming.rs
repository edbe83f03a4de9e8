//! Local file names for retrieved artifacts

use chrono::{DateTime, SecondsFormat, Utc};

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn strip_last_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    }
}

/// RFC 3339 with colons swapped for underscores, safe on every filesystem
pub fn file_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true).replace(':', "_")
}

/// Insert the timestamp between the stem and the extensions:
/// `flame.svg` becomes `flame-<ts>.svg`, `flame` becomes `flame-<ts>`.
pub fn compose(file_name: &str, t: DateTime<Utc>) -> String {
    let ts = file_timestamp(t);
    match file_name.split_once('.') {
        Some((stem, ext)) => format!("{stem}-{ts}.{ext}"),
        None => format!("{file_name}-{ts}"),
    }
}

/// Local name of a remote (compressed) file:
/// `/some/dir/name.part.gz` at `2023-02-28T11:44:12Z` becomes
/// `name-2023-02-28T11_44_12Z.part`.
pub fn rename(remote: &str, t: DateTime<Utc>) -> String {
    compose(strip_last_extension(basename(remote)), t)
}

/// Local name of a remote file that carries no compression suffix
pub fn rename_uncompressed(remote: &str, t: DateTime<Utc>) -> String {
    compose(basename(remote), t)
}

/// Local name of a chunk; the `.NN` index stays at the end so chunks sort
/// and remain distinct: `/tmp/heap.hprof.gz.00` becomes
/// `heap-<ts>.hprof.gz.00`.
pub fn rename_chunk(remote: &str, t: DateTime<Utc>) -> String {
    let base = basename(remote);
    match base.rfind('.') {
        Some(i) if i > 0 => format!("{}{}", compose(&base[..i], t), &base[i..]),
        _ => compose(base, t),
    }
}

/// Prefix a local name with the pod it was profiled on
pub fn with_pod_prefix(target_pod: &str, name: &str) -> String {
    format!("{target_pod}-{name}")
}
