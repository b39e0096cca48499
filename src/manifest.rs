//! 파일 목록 (한 줄에 파일 이름 하나)

use std::path::Path;

use crate::Result;

/// 매니페스트 텍스트 파싱
///
/// 앞뒤 공백은 제거하고 빈 줄은 건너뛴다. 순서는 유지.
pub fn parse_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// 매니페스트 파일 읽기
pub async fn read_manifest(path: &Path) -> Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(parse_manifest(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let text = "a.txt\r\n\n  b.bin  \nmissing.txt\n";
        assert_eq!(parse_manifest(text), vec!["a.txt", "b.bin", "missing.txt"]);
        assert!(parse_manifest("\n \n").is_empty());
    }

    #[tokio::test]
    async fn test_read_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.txt");
        std::fs::write(&path, "a.txt\nmissing.txt\n").unwrap();

        assert_eq!(
            read_manifest(&path).await.unwrap(),
            vec!["a.txt".to_string(), "missing.txt".to_string()]
        );
        assert!(read_manifest(&dir.path().join("nope.txt")).await.is_err());
    }
}
