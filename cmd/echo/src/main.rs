//! corio echo server
//!
//! Every connection runs as a coroutine written in plain blocking style;
//! the hooked accept/read/write calls park it on the reactor whenever the
//! socket would block. One OS thread serves all connections.
//!
//! Usage:
//!     cargo run --release -p corio-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9000

use std::os::fd::RawFd;
use std::sync::Arc;

use corio_core::{env_get, kinfo};
use corio_reactor::hook;
use corio_reactor::reactor::{self, ReactorKind};
use corio_runtime::pool;

fn make_listener(port: u16) -> RawFd {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket failed");

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "bind to port {} failed", port);
        assert_eq!(libc::listen(fd, 128), 0, "listen failed");
        fd
    }
}

/// Blocking-style per-connection loop; runs inside a worker coroutine.
fn serve_connection(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { hook::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let m = unsafe {
                hook::write(
                    fd,
                    buf[sent..].as_ptr() as *const libc::c_void,
                    n as usize - sent,
                )
            };
            if m <= 0 {
                unsafe { libc::close(fd) };
                return;
            }
            sent += m as usize;
        }
    }
    unsafe { libc::close(fd) };
}

fn acceptor(listen_fd: RawFd) {
    loop {
        let fd = unsafe { hook::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            kinfo!("accept failed, shutting down acceptor");
            break;
        }
        kinfo!("accepted connection on fd {}", fd);

        let cor = match pool().acquire() {
            Ok(cor) => cor,
            Err(e) => {
                kinfo!("pool exhausted ({}), dropping connection", e);
                unsafe { libc::close(fd) };
                continue;
            }
        };
        let conn = cor.clone();
        cor.set_callback(move || {
            serve_connection(fd);
            // recycle after this callback has fully unwound; the release
            // would be refused while the coroutine is still mid-entry
            let done = conn.clone();
            reactor::current().add_task(Box::new(move || pool().release(&done)));
        });
        reactor::current().add_coroutine(cor);
    }
}

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| env_get("CORIO_ECHO_PORT", 9000));

    hook::set_hook_enabled(true);
    let r = reactor::init_thread(ReactorKind::Main);

    let listen_fd = make_listener(port);
    kinfo!("echo server listening on port {}", port);

    let cor = pool().acquire().expect("pool empty at startup");
    cor.set_callback(move || acceptor(listen_fd));
    r.add_coroutine(cor);

    let stopper = r.clone();
    let _ = ctrl_c_to_stop(Arc::new(move || stopper.stop()));

    r.run().expect("reactor loop failed");
}

/// Best-effort SIGINT handler so the loop exits cleanly.
fn ctrl_c_to_stop(stop: Arc<dyn Fn() + Send + Sync>) -> bool {
    use std::sync::OnceLock;
    static STOP: OnceLock<Arc<dyn Fn() + Send + Sync>> = OnceLock::new();
    if STOP.set(stop).is_err() {
        return false;
    }

    extern "C" fn on_sigint(_: libc::c_int) {
        if let Some(stop) = STOP.get() {
            stop();
        }
    }
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) != libc::SIG_ERR }
}
