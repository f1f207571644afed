//! Local pipe transport.
//!
//! Windows: a named pipe at `\\.\pipe\winmuxd`, each instance created
//! with a security descriptor granting access only to the current user's
//! SID. Elsewhere: a Unix domain socket `winmuxd.sock` in the user's
//! runtime directory with 0600 permissions.

use std::io;

/// Well-known endpoint name.
pub const PIPE_NAME: &str = "winmuxd";

#[cfg(windows)]
pub use windows_impl::{connect, PipeListener, PipeStream};

#[cfg(unix)]
pub use unix_impl::{connect, connect_at, socket_path, PipeListener, PipeStream};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};

    pub type PipeStream = UnixStream;

    /// Socket location: `$XDG_RUNTIME_DIR/winmux/winmuxd.sock`, falling
    /// back to a per-user directory under /tmp.
    pub fn socket_path() -> PathBuf {
        let base = std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("winmux"))
            .unwrap_or_else(|_| PathBuf::from(format!("/tmp/winmux-{}", whoami())));
        base.join(format!("{PIPE_NAME}.sock"))
    }

    fn whoami() -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }

    #[derive(Debug)]
    pub struct PipeListener {
        listener: UnixListener,
    }

    impl PipeListener {
        pub fn bind() -> io::Result<Self> {
            Self::bind_at(&socket_path())
        }

        /// Bind at an explicit path (tests use temp directories).
        pub fn bind_at(path: &Path) -> io::Result<Self> {
            // Probe a pre-existing socket: live server → refuse to clobber,
            // dead one → stale file, safe to remove.
            if path.exists() {
                match std::os::unix::net::UnixStream::connect(path) {
                    Ok(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("another daemon is already listening on {}", path.display()),
                        ));
                    }
                    Err(_) => {
                        std::fs::remove_file(path)?;
                    }
                }
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let listener = UnixListener::bind(path)?;

            // Owner-only access, the Unix equivalent of the pipe ACL.
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

            tracing::info!(path = %path.display(), "listening on unix socket");
            Ok(Self { listener })
        }

        pub async fn accept(&mut self) -> io::Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    pub async fn connect() -> io::Result<PipeStream> {
        connect_at(&socket_path()).await
    }

    pub async fn connect_at(path: &Path) -> io::Result<PipeStream> {
        UnixStream::connect(path).await
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

    pub const PIPE_PATH: &str = r"\\.\pipe\winmuxd";

    const ERROR_PIPE_BUSY: i32 = 231;

    /// Either side of an open pipe connection.
    pub enum PipeStream {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_read(cx, buf),
                PipeStream::Client(c) => Pin::new(c).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_write(cx, buf),
                PipeStream::Client(c) => Pin::new(c).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_flush(cx),
                PipeStream::Client(c) => Pin::new(c).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(s) => Pin::new(s).poll_shutdown(cx),
                PipeStream::Client(c) => Pin::new(c).poll_shutdown(cx),
            }
        }
    }

    pub struct PipeListener {
        /// The instance currently waiting for a connection. A fresh one is
        /// prepared as soon as a client lands on this one.
        next: Option<NamedPipeServer>,
    }

    impl PipeListener {
        pub fn bind() -> io::Result<Self> {
            let first = acl::create_instance(true)?;
            tracing::info!(pipe = PIPE_PATH, "listening on named pipe");
            Ok(Self { next: Some(first) })
        }

        pub async fn accept(&mut self) -> io::Result<PipeStream> {
            let server = match self.next.take() {
                Some(server) => server,
                None => acl::create_instance(false)?,
            };
            server.connect().await?;
            // Prepare the next instance before handing this one off so a
            // new client can land while this connection is being served.
            self.next = acl::create_instance(false).ok();
            Ok(PipeStream::Server(server))
        }
    }

    pub async fn connect() -> io::Result<PipeStream> {
        // The pipe may briefly have no free instance while the daemon
        // prepares the next one; retry on ERROR_PIPE_BUSY.
        for _ in 0..10 {
            match ClientOptions::new().open(PIPE_PATH) {
                Ok(client) => return Ok(PipeStream::Client(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "named pipe busy: no free instance",
        ))
    }

    /// Pipe instances restricted to the current user's SID.
    mod acl {
        use super::*;
        use windows_sys::Win32::Foundation::{CloseHandle, LocalFree, HANDLE};
        use windows_sys::Win32::Security::Authorization::{
            ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
            SDDL_REVISION_1,
        };
        use windows_sys::Win32::Security::{
            GetTokenInformation, TokenUser, SECURITY_ATTRIBUTES, TOKEN_QUERY, TOKEN_USER,
        };
        use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        /// String SID of the user this process runs as.
        fn current_user_sid() -> io::Result<String> {
            unsafe {
                let mut token: HANDLE = 0;
                if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                    return Err(io::Error::last_os_error());
                }

                let mut needed = 0u32;
                GetTokenInformation(token, TokenUser, std::ptr::null_mut(), 0, &mut needed);
                let mut buf = vec![0u8; needed as usize];
                if GetTokenInformation(
                    token,
                    TokenUser,
                    buf.as_mut_ptr().cast(),
                    needed,
                    &mut needed,
                ) == 0
                {
                    CloseHandle(token);
                    return Err(io::Error::last_os_error());
                }
                CloseHandle(token);

                let token_user = &*(buf.as_ptr() as *const TOKEN_USER);
                let mut sid_str: *mut u16 = std::ptr::null_mut();
                if ConvertSidToStringSidW(token_user.User.Sid, &mut sid_str) == 0 {
                    return Err(io::Error::last_os_error());
                }

                let mut len = 0;
                while *sid_str.add(len) != 0 {
                    len += 1;
                }
                let sid = String::from_utf16_lossy(std::slice::from_raw_parts(sid_str, len));
                LocalFree(sid_str as _);
                Ok(sid)
            }
        }

        /// Create one listening instance with full control granted only to
        /// the owning user.
        pub fn create_instance(first: bool) -> io::Result<NamedPipeServer> {
            let sid = current_user_sid()?;
            let sddl = format!("D:P(A;;GA;;;{sid})");
            let mut sddl_utf16: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();

            unsafe {
                let mut descriptor = std::ptr::null_mut();
                if ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    sddl_utf16.as_mut_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    std::ptr::null_mut(),
                ) == 0
                {
                    return Err(io::Error::last_os_error());
                }

                let mut attributes = SECURITY_ATTRIBUTES {
                    nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                    lpSecurityDescriptor: descriptor,
                    bInheritHandle: 0,
                };

                let result = ServerOptions::new()
                    .first_pipe_instance(first)
                    .create_with_security_attributes_raw(
                        PIPE_PATH,
                        &mut attributes as *mut _ as *mut std::ffi::c_void,
                    );
                LocalFree(descriptor as _);
                result
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn socket_path_is_user_scoped() {
        let path = socket_path();
        assert!(path.to_str().unwrap().contains("winmuxd.sock"));
    }

    #[tokio::test]
    async fn bind_accept_connect_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winmuxd.sock");
        let mut listener = PipeListener::bind_at(&path).unwrap();

        let client_path = path.clone();
        let client = tokio::spawn(async move {
            let mut stream = connect_at(&client_path).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut server_side = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        server_side.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winmuxd.sock");
        let _listener = PipeListener::bind_at(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winmuxd.sock");
        {
            let _first = PipeListener::bind_at(&path).unwrap();
        }
        // first listener dropped; the leftover file is stale
        let second = PipeListener::bind_at(&path);
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn live_socket_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winmuxd.sock");
        let _live = PipeListener::bind_at(&path).unwrap();

        let err = PipeListener::bind_at(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
