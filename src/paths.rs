//! 와이어 파일 이름을 로컬 경로로 변환

use std::path::{Component, Path, PathBuf};

use crate::message::validate_filename;
use crate::{Error, Result};

/// `root` 아래의 경로로 변환
///
/// 절대 경로, `..`, 드라이브 prefix 등 root 밖을 가리킬 수 있는 이름은 거부한다.
/// 하위 디렉터리(`docs/a.txt`)는 허용.
pub fn resolve_within(root: &Path, filename: &str) -> Result<PathBuf> {
    validate_filename(filename)?;

    let relative = Path::new(filename);
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(Error::InvalidFilename(filename.to_string())),
        }
    }

    if resolved == root {
        return Err(Error::InvalidFilename(filename.to_string()));
    }
    Ok(resolved)
}
