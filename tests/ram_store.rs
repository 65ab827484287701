// tests/ram_store.rs
//
// Запуск только этого файла:
//   cargo test --test ram_store -- --nocapture
//
// Покрываем (поколения в memfd, без движка):
// 1) create → запись → commit: финальный путь существует и читается с начала.
// 2) Перезапись tmp не трогает опубликованное поколение до следующего commit.
// 3) Каждый open_read получает своё смещение.
// 4) discard_tmp, release_all, used_bytes.
// 5) Слот за пределами таблицы: EINVAL; чтение отсутствующего: ENOENT.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Result;

use SnapRewind::consts::RAM_SLOTS;
use SnapRewind::snapshot::{GenerationPaths, RamStore};
use SnapRewind::GenerationKind;

fn leak_store() -> &'static RamStore {
    Box::leak(Box::new(RamStore::new()))
}

fn publish(p: &GenerationPaths, meta: &[u8], bytes: &[u8]) -> Result<()> {
    p.meta_tmp.create()?.write_all(meta)?;
    p.bytes_tmp.create()?.write_all(bytes)?;
    p.commit()?;
    Ok(())
}

fn read_all(mut f: std::fs::File) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    f.read_to_end(&mut v)?;
    Ok(v)
}

#[test]
fn commit_publishes_and_tmp_is_private() -> Result<()> {
    let store = leak_store();
    let p = GenerationPaths::in_ram(store, GenerationKind::Slot(2))?;
    assert!(p.meta.is_in_ram());
    assert!(!p.exists());
    assert!(format!("{:?}", p.meta).contains("state2.pm"));

    let err = p.meta.open_read().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

    publish(&p, b"meta-v1", &[7u8; 8192])?;
    assert!(p.exists());
    assert!(!p.meta_tmp.exists() && !p.bytes_tmp.exists());
    assert_eq!(read_all(p.meta.open_read()?)?, b"meta-v1");
    assert_eq!(store.used_bytes(), 7 + 8192);

    // новый tmp: опубликованное не меняется
    p.meta_tmp.create()?.write_all(b"meta-v2-longer")?;
    assert_eq!(read_all(p.meta.open_read()?)?, b"meta-v1");
    p.discard_tmp();
    assert!(!p.meta_tmp.exists());
    assert_eq!(read_all(p.meta.open_read()?)?, b"meta-v1");

    // второй commit заменяет поколение целиком
    publish(&p, b"v3", &[1u8; 4096])?;
    assert_eq!(read_all(p.meta.open_read()?)?, b"v3");
    assert_eq!(read_all(p.bytes.open_read()?)?.len(), 4096);
    assert_eq!(store.used_bytes(), 2 + 4096);

    store.release_all();
    assert!(!p.exists());
    assert_eq!(store.used_bytes(), 0);
    Ok(())
}

#[test]
fn readers_have_independent_offsets() -> Result<()> {
    let store = leak_store();
    let p = GenerationPaths::in_ram(store, GenerationKind::Base)?;
    let payload: Vec<u8> = (0..=255u8).cycle().take(3 * 4096).collect();
    publish(&p, b"hdr", &payload)?;

    let mut a = p.bytes.open_read()?;
    let mut b = p.bytes.open_read()?;
    a.seek(SeekFrom::Start(4096))?;
    let mut x = [0u8; 4];
    let mut y = [0u8; 4];
    a.read_exact(&mut x)?;
    b.read_exact(&mut y)?;
    assert_eq!(x, [0, 1, 2, 3]);
    assert_eq!(y, [0, 1, 2, 3]);
    assert_eq!(a.stream_position()?, 4100);
    assert_eq!(b.stream_position()?, 4);

    // base и слот живут в разных ячейках
    let s0 = GenerationPaths::in_ram(store, GenerationKind::Slot(0))?;
    assert!(!s0.exists());
    store.release_all();
    Ok(())
}

#[test]
fn slot_range_is_bounded() {
    let store = leak_store();
    assert!(GenerationPaths::in_ram(store, GenerationKind::Slot(RAM_SLOTS as u32 - 1)).is_ok());
    let err = GenerationPaths::in_ram(store, GenerationKind::Slot(RAM_SLOTS as u32)).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}
