//! End-to-end behaviour of the open interceptor against real memfds and real files.

use std::ffi::{c_void, CString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libc::{c_char, c_int, mode_t};
use memload_config::testing::TestEnvironment;
use memload_core::{
    registry, BackingStore, DlsymResolver, HookError, HookTarget, InstallState, Interceptor,
    Interposition, MemfdStore, Registry, SymbolResolver,
};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use once_cell::sync::Lazy;
use serial_test::serial;

unsafe extern "C" fn libc_openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    libc::openat(dirfd, path, flags, mode as libc::c_uint)
}

static FORWARDED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counting_openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    FORWARDED.fetch_add(1, Ordering::SeqCst);
    libc_openat(dirfd, path, flags, mode)
}

/// Refuses to create anything.
struct FailingStore;

impl BackingStore for FailingStore {
    fn create(&self, _cloexec: bool) -> io::Result<OwnedFd> {
        Err(io::Error::from_raw_os_error(libc::EMFILE))
    }
}

/// Hands out memfds sealed against writes, so filling them fails with EPERM.
struct SealedStore;

impl BackingStore for SealedStore {
    fn create(&self, _cloexec: bool) -> io::Result<OwnedFd> {
        let fd = memfd_create(c"sealed", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let rc = unsafe {
            libc::fcntl(
                fd.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_WRITE | libc::F_SEAL_GROW,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

fn interceptor<S: BackingStore>(registry: &Registry, store: S) -> Interceptor<'_, S> {
    let interceptor = Interceptor::new(registry, store);
    interceptor.install_original(libc_openat).unwrap();
    interceptor
}

fn c_path(path: &Path) -> CString {
    CString::new(path.to_str().unwrap()).unwrap()
}

fn open<S: BackingStore>(
    interceptor: &Interceptor<'_, S>,
    path: &CString,
    flags: c_int,
) -> (c_int, i32) {
    let fd = unsafe { interceptor.open_at(libc::AT_FDCWD, path.as_ptr(), flags, 0) };
    let errno = if fd < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        0
    };
    (fd, errno)
}

fn read_all(fd: c_int) -> Vec<u8> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    out
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_substitution_scenario() {
    let env = TestEnvironment::new().unwrap();
    let on_disk = env
        .create_file("system/lib64/libfoo.so", b"on-disk library")
        .unwrap();
    let path = c_path(&on_disk);

    let registry = Registry::new();
    let bytes = payload(100);
    registry.register("libfoo.so", &bytes).unwrap();
    let interceptor = interceptor(&registry, MemfdStore::default());

    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY);
    assert!(fd >= 0);
    assert_eq!(unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) }, 0);

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
    assert_eq!(st.st_size, 100);

    assert_eq!(read_all(fd), bytes);
    assert!(!registry.contains("libfoo.so"));

    // Consumed: the second open reaches the real file.
    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY);
    assert!(fd >= 0);
    assert_eq!(read_all(fd), b"on-disk library");
}

#[test]
fn test_second_open_fails_like_original_when_absent() {
    let env = TestEnvironment::new().unwrap();
    let path = c_path(&env.path("missing/libbar.so"));

    let registry = Registry::new();
    registry.register("libbar.so", b"\x7fELF").unwrap();
    let interceptor = interceptor(&registry, MemfdStore::default());

    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY);
    assert_eq!(read_all(fd), b"\x7fELF");

    let (fd, errno) = open(&interceptor, &path, libc::O_RDONLY);
    assert_eq!(fd, -1);
    assert_eq!(errno, libc::ENOENT);
}

#[test]
fn test_content_fidelity_across_sizes() {
    let registry = Registry::new();
    let interceptor = interceptor(&registry, MemfdStore::default());

    for (i, len) in [0usize, 1, 4096, 1 << 20].into_iter().enumerate() {
        let fragment = format!("libsize{}.so", i);
        let bytes = payload(len);
        registry.register(&fragment, &bytes).unwrap();

        let path = CString::new(format!("/nonexistent/lib/{}", fragment)).unwrap();
        let (fd, errno) = open(&interceptor, &path, libc::O_RDONLY);
        assert!(fd >= 0, "open failed for {} bytes: errno {}", len, errno);
        assert_eq!(read_all(fd), bytes);
    }
    assert!(registry.is_empty());
}

#[test]
fn test_unmatched_paths_are_transparent() {
    let env = TestEnvironment::new().unwrap();
    let existing = c_path(&env.create_file("lib/libc.so", b"real").unwrap());
    let missing = c_path(&env.path("lib/libm.so"));

    let registry = Registry::new();
    registry.register("libfoo.so", b"x").unwrap();
    let interceptor = interceptor(&registry, MemfdStore::default());

    let (fd, _) = open(&interceptor, &existing, libc::O_RDONLY);
    assert_eq!(read_all(fd), b"real");

    let (hooked_fd, hooked_errno) = open(&interceptor, &missing, libc::O_RDONLY);
    let direct_fd = unsafe { libc_openat(libc::AT_FDCWD, missing.as_ptr(), libc::O_RDONLY, 0) };
    let direct_errno = io::Error::last_os_error().raw_os_error().unwrap();
    assert_eq!(hooked_fd, direct_fd);
    assert_eq!(hooked_errno, direct_errno);

    // O_CREAT with a mode goes through untouched as well.
    let created = c_path(&env.path("lib/new.so"));
    let fd = unsafe {
        interceptor.open_at(libc::AT_FDCWD, created.as_ptr(), libc::O_WRONLY | libc::O_CREAT, 0o644)
    };
    assert!(fd >= 0);
    unsafe { libc::close(fd) };
    assert!(env.path("lib/new.so").exists());

    assert!(registry.contains("libfoo.so"));
}

#[test]
fn test_dirfd_relative_open_is_forwarded() {
    let env = TestEnvironment::new().unwrap();
    env.create_file("lib/libz.so", b"zlib").unwrap();
    let dir = File::open(env.path("lib")).unwrap();

    let registry = Registry::new();
    let interceptor = interceptor(&registry, MemfdStore::default());

    let fd =
        unsafe { interceptor.open_at(dir.as_raw_fd(), c"libz.so".as_ptr(), libc::O_RDONLY, 0) };
    assert_eq!(read_all(fd), b"zlib");
}

#[test]
fn test_first_match_wins_on_overlap() {
    let registry = Registry::new();
    registry.register("lib.so", b"short fragment").unwrap();
    registry.register("a/lib.so", b"long fragment").unwrap();
    let interceptor = interceptor(&registry, MemfdStore::default());

    let (fd, _) = open(&interceptor, &CString::new("/a/lib.so").unwrap(), libc::O_RDONLY);
    assert_eq!(read_all(fd), b"short fragment");
    assert_eq!(registry.fragments(), vec!["a/lib.so"]);

    let (fd, _) = open(&interceptor, &CString::new("/a/lib.so").unwrap(), libc::O_RDONLY);
    assert_eq!(read_all(fd), b"long fragment");
    assert!(registry.is_empty());
}

#[test]
fn test_reregistration_serves_latest() {
    let registry = Registry::new();
    registry.register("libfoo.so", b"B1").unwrap();
    registry.register("libfoo.so", b"B2").unwrap();
    assert_eq!(registry.len(), 1);

    let interceptor = interceptor(&registry, MemfdStore::default());
    let (fd, _) = open(&interceptor, &CString::new("/lib/libfoo.so").unwrap(), libc::O_RDONLY);
    assert_eq!(read_all(fd), b"B2");
}

#[test]
fn test_backing_store_failure_keeps_entry() {
    let registry = Registry::new();
    registry.register("libfoo.so", b"x").unwrap();
    let interceptor = interceptor(&registry, FailingStore);

    let (fd, errno) = open(&interceptor, &CString::new("/lib/libfoo.so").unwrap(), libc::O_RDONLY);
    assert_eq!(fd, -1);
    assert_eq!(errno, libc::EMFILE);
    assert!(registry.contains("libfoo.so"));
}

#[test]
fn test_write_failure_consumes_entry() {
    let registry = Registry::new();
    registry.register("libfoo.so", b"content").unwrap();
    let interceptor = interceptor(&registry, SealedStore);

    let (fd, errno) = open(&interceptor, &CString::new("/lib/libfoo.so").unwrap(), libc::O_RDONLY);
    assert_eq!(fd, -1);
    assert_eq!(errno, libc::EPERM);
    assert!(!registry.contains("libfoo.so"));
}

#[test]
fn test_cloexec_is_honoured() {
    let registry = Registry::new();
    registry.register("a.so", b"a").unwrap();
    registry.register("b.so", b"b").unwrap();
    let interceptor = interceptor(&registry, MemfdStore::default());

    let path = CString::new("/lib/a.so").unwrap();
    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY | libc::O_CLOEXEC);
    assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) } & libc::FD_CLOEXEC, 0);
    unsafe { libc::close(fd) };

    let (fd, _) = open(&interceptor, &CString::new("/lib/b.so").unwrap(), libc::O_RDONLY);
    assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFD) } & libc::FD_CLOEXEC, 0);
    unsafe { libc::close(fd) };
}

#[test]
fn test_null_path_goes_to_original() {
    let registry = Registry::new();
    registry.register("", b"matches everything").unwrap();
    let interceptor = Interceptor::new(&registry, MemfdStore::default());
    interceptor.install_original(counting_openat).unwrap();

    let before = FORWARDED.load(Ordering::SeqCst);
    let fd = unsafe { interceptor.open_at(libc::AT_FDCWD, std::ptr::null(), libc::O_RDONLY, 0) };
    assert_eq!(fd, -1);
    assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::EFAULT));
    assert_eq!(FORWARDED.load(Ordering::SeqCst), before + 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_forward_before_install_uses_kernel() {
    let env = TestEnvironment::new().unwrap();
    let path = c_path(&env.create_file("early.so", b"early").unwrap());

    let registry = Registry::new();
    let interceptor = Interceptor::new(&registry, MemfdStore::default());
    assert_eq!(interceptor.state(), InstallState::Uninstalled);

    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY);
    assert_eq!(read_all(fd), b"early");
}

#[test]
fn test_registration_waits_for_install() {
    let env = TestEnvironment::new().unwrap();
    let path = c_path(&env.create_file("lib/libwait.so", b"disk").unwrap());

    let registry = Registry::new();
    registry.register("libwait.so", b"memory").unwrap();
    let interceptor = Interceptor::new(&registry, MemfdStore::default());

    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY);
    assert_eq!(read_all(fd), b"disk");
    assert!(registry.contains("libwait.so"));

    interceptor.install_original(libc_openat).unwrap();
    assert!(!interceptor.is_hooked_by(libc_openat));
    let (fd, _) = open(&interceptor, &path, libc::O_RDONLY);
    assert_eq!(read_all(fd), b"memory");
}

#[test]
fn test_racing_opens_serve_once() {
    const THREADS: usize = 8;

    let env = TestEnvironment::new().unwrap();
    let path = c_path(&env.create_file("lib/librace.so", b"disk").unwrap());

    let registry = Registry::new();
    registry.register("librace.so", b"memory").unwrap();
    let interceptor = interceptor(&registry, MemfdStore::default());
    let served = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let interceptor = &interceptor;
            let path = &path;
            let served = Arc::clone(&served);
            scope.spawn(move || {
                let (fd, _) = open(interceptor, path, libc::O_RDONLY);
                match read_all(fd).as_slice() {
                    b"memory" => {
                        served.fetch_add(1, Ordering::SeqCst);
                    }
                    other => assert_eq!(other, b"disk"),
                }
            });
        }
    });

    assert_eq!(served.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[test]
#[serial]
fn test_global_registry_roundtrip() {
    let interceptor = interceptor(registry(), MemfdStore::new("global-test"));
    registry().register("libglobal-roundtrip.so", b"global").unwrap();

    let (fd, _) = open(
        &interceptor,
        &CString::new("/vendor/lib64/libglobal-roundtrip.so").unwrap(),
        libc::O_RDONLY,
    );
    assert_eq!(read_all(fd), b"global");
    assert!(!registry().contains("libglobal-roundtrip.so"));
}

static HOOK_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static HOOKED: Lazy<Interceptor<'static, MemfdStore>> =
    Lazy::new(|| Interceptor::new(&HOOK_REGISTRY, MemfdStore::default()));

unsafe extern "C" fn hooked_openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    HOOKED.open_at(dirfd, path, flags, mode)
}

#[test]
fn test_install_through_interposition() {
    let target = HookTarget::next("openat");
    unsafe { HOOKED.install(&target, hooked_openat, &DlsymResolver, &Interposition) }.unwrap();
    assert_eq!(HOOKED.state(), InstallState::Installed);

    let expected = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"openat".as_ptr()) };
    assert_eq!(HOOKED.original().map(|f| f as *mut c_void), Some(expected));

    assert!(HOOKED.is_hooked_by(hooked_openat));
    assert!(!HOOKED.is_hooked_by(libc_openat));

    let again = unsafe { HOOKED.install(&target, hooked_openat, &DlsymResolver, &Interposition) };
    assert_eq!(again, Err(HookError::AlreadyInstalled));
    assert_eq!(HOOKED.install_original(libc_openat), Err(HookError::AlreadyInstalled));

    // Repeat installs through the C entry point report success without changes.
    let repeat = unsafe {
        HOOKED.ensure_installed(&target, hooked_openat, &DlsymResolver, &Interposition)
    };
    assert_eq!(repeat, Ok(false));

    HOOK_REGISTRY.register("libinstalled.so", b"installed").unwrap();
    let fd = unsafe {
        hooked_openat(libc::AT_FDCWD, c"/lib/libinstalled.so".as_ptr(), libc::O_RDONLY, 0)
    };
    assert_eq!(read_all(fd), b"installed");
}

/// Resolves every target to one fixed address.
struct FixedResolver(NonNull<c_void>);

impl SymbolResolver for FixedResolver {
    fn resolve(&self, _target: &HookTarget) -> Result<NonNull<c_void>, HookError> {
        Ok(self.0)
    }

    fn resolve_global(&self, _symbol: &str) -> Result<NonNull<c_void>, HookError> {
        Ok(self.0)
    }
}

#[test]
fn test_install_refuses_self_target() {
    let registry = Registry::new();
    let interceptor = Interceptor::new(&registry, MemfdStore::default());
    let resolver = FixedResolver(NonNull::new(counting_openat as *mut c_void).unwrap());

    let err = unsafe {
        interceptor.install(&HookTarget::next("openat"), counting_openat, &resolver, &Interposition)
    };
    assert!(matches!(err, Err(HookError::ResolvesToHook(_))));
    assert_eq!(interceptor.state(), InstallState::Uninstalled);
}

#[test]
fn test_install_missing_symbol_stays_uninstalled() {
    let registry = Registry::new();
    let interceptor = Interceptor::new(&registry, MemfdStore::default());

    let err = unsafe {
        interceptor.install(
            &HookTarget::next("memload_missing_openat"),
            libc_openat,
            &DlsymResolver,
            &Interposition,
        )
    };
    assert!(matches!(err, Err(HookError::SymbolNotFound { .. })));
    assert_eq!(interceptor.state(), InstallState::Uninstalled);
}

#[test]
fn test_ensure_installed_reports_first_install() {
    let registry = Registry::new();
    let interceptor = Interceptor::new(&registry, MemfdStore::default());
    let target = HookTarget::next("openat");

    let first = unsafe {
        interceptor.ensure_installed(&target, counting_openat, &DlsymResolver, &Interposition)
    };
    assert_eq!(first, Ok(true));
    let second = unsafe {
        interceptor.ensure_installed(&target, counting_openat, &DlsymResolver, &Interposition)
    };
    assert_eq!(second, Ok(false));
    assert!(interceptor.is_hooked_by(counting_openat));

    let missing = Interceptor::new(&registry, MemfdStore::default());
    let err = unsafe {
        missing.ensure_installed(
            &HookTarget::next("memload_missing_openat"),
            counting_openat,
            &DlsymResolver,
            &Interposition,
        )
    };
    assert!(matches!(err, Err(HookError::SymbolNotFound { .. })));
}
