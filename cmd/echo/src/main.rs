//! TCP echo server on ufiber
//!
//! One fiber per connection. Socket calls go through `ufiber::hook`, so a
//! fiber blocked in `read` only suspends itself while its processor keeps
//! serving other connections.
//!
//! Usage:
//!     cargo build --release -p ufiber-echo
//!     ./target/release/ufiber-echo [port] [max_conns]
//!
//! Test with:
//!     echo "hello" | nc -q0 localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use ufiber::{hook, kdebug, kinfo, kwarn, Runtime, RuntimeConfig};

const BUF_SIZE: usize = 4096;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    // 0 = serve forever
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    let listener = match setup_listener(port) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("listen on port {} failed: {}", port, e);
            std::process::exit(1);
        }
    };

    let config = RuntimeConfig::from_env().hook_enabled(true);
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "ufiber-echo listening on :{} ({} processors)",
        port,
        runtime.num_processors()
    );

    let served = Arc::new(AtomicUsize::new(0));
    let s = served.clone();
    let result = runtime.block_on(move || accept_loop(listener, max_conns, s));
    if let Err(e) = result {
        eprintln!("accept loop failed: {}", e);
    }

    hook::close(listener);
    println!(
        "served {} connections, stats: {:?}",
        served.load(Ordering::Relaxed),
        runtime.stats()
    );
    runtime.shutdown();
}

fn accept_loop(listener: i32, max_conns: usize, served: Arc<AtomicUsize>) {
    let mut accepted = 0usize;
    while max_conns == 0 || accepted < max_conns {
        // Safety: null address out-params are allowed by accept(2)
        let fd = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            kwarn!("accept failed: {}", io::Error::last_os_error());
            continue;
        }
        accepted += 1;
        let served = served.clone();
        ufiber::spawn(move || {
            serve(fd);
            served.fetch_add(1, Ordering::Relaxed);
        });
    }
    kinfo!("accepted {} connections, stopping", accepted);
}

fn serve(fd: i32) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = hook::read(fd, &mut buf);
        if n <= 0 {
            if n < 0 {
                kdebug!("fd {}: read failed: {}", fd, io::Error::last_os_error());
            }
            break;
        }
        if !write_all(fd, &buf[..n as usize]) {
            break;
        }
    }
    hook::close(fd);
}

fn write_all(fd: i32, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        let n = hook::write(fd, data);
        if n <= 0 {
            kdebug!("fd {}: write failed: {}", fd, io::Error::last_os_error());
            return false;
        }
        data = &data[n as usize..];
    }
    true
}

fn setup_listener(port: u16) -> io::Result<i32> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const _,
            std::mem::size_of::<i32>() as u32,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_addr.s_addr = 0; // INADDR_ANY
        addr.sin_port = port.to_be();

        let ret = libc::bind(
            fd,
            &addr as *const _ as *const _,
            std::mem::size_of_val(&addr) as u32,
        );
        if ret != 0 || libc::listen(fd, 1024) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}
