/**
 * ffi/coordinator.rs
 *
 * FFI bindings for the rendezvous client
 */

use super::*;
use crate::coordinator::{CoordinatorClient, CoordinatorConfig, JoinResult, Visibility};
use crate::game_info::GameInfo;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::raw::c_char;
use std::rc::Rc;

/// Client plus the join results waiting to be collected
struct FfiClient {
    client: CoordinatorClient,
    finished: Rc<RefCell<VecDeque<JoinResult>>>,
}

fn client_mut<'a>(handle: *mut RendezvousClientHandle) -> Option<&'a mut FfiClient> {
    if handle.is_null() {
        set_last_error("Null client handle");
        return None;
    }
    Some(unsafe { &mut *(handle as *mut FfiClient) })
}

/// Create a client. `config_json` may be null for defaults.
#[no_mangle]
pub extern "C" fn rendezvous_client_create(config_json: *const c_char) -> *mut RendezvousClientHandle {
    let config = if config_json.is_null() {
        CoordinatorConfig::default()
    } else {
        let Some(json) = c_str_to_rust(config_json) else {
            set_last_error("Configuration is not valid UTF-8");
            return std::ptr::null_mut();
        };
        match serde_json::from_str::<CoordinatorConfig>(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&format!("Invalid configuration: {}", e));
                return std::ptr::null_mut();
            }
        }
    };

    let client = Box::new(FfiClient {
        client: CoordinatorClient::new(config),
        finished: Rc::default(),
    });
    Box::into_raw(client) as *mut RendezvousClientHandle
}

/// Free a client, dropping all connections and pending joins
#[no_mangle]
pub extern "C" fn rendezvous_client_free(handle: *mut RendezvousClientHandle) {
    if !handle.is_null() {
        unsafe {
            let mut client = Box::from_raw(handle as *mut FfiClient);
            client.client.shutdown();
        }
    }
}

/// Run one tick; call every frame of the host loop
/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn rendezvous_client_send_receive(handle: *mut RendezvousClientHandle) -> i32 {
    let Some(ffi) = client_mut(handle) else {
        return -1;
    };
    ffi.client.send_receive();
    // Events carry sockets only the Rust API can use; drop them here.
    for event in ffi.client.take_events() {
        log::debug!("[ffi] event {:?}", event);
    }
    0
}

/// Register a hosted game. `visibility` is 0 (friends only) or 1 (public).
/// `revision` may be null to use the configured revision.
/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn rendezvous_client_register(
    handle: *mut RendezvousClientHandle,
    visibility: u8,
    port: u16,
    name: *const c_char,
    revision: *const c_char,
) -> i32 {
    let Some(ffi) = client_mut(handle) else {
        return -1;
    };
    let Some(visibility) = Visibility::from_wire(visibility) else {
        set_last_error(&format!("Invalid visibility: {}", visibility));
        return -1;
    };
    let Some(server_name) = c_str_to_rust(name) else {
        set_last_error("Invalid server name");
        return -1;
    };
    let server_revision = c_str_to_rust(revision).unwrap_or_else(|| ffi.client.config().revision.clone());

    let info = GameInfo {
        server_name,
        server_revision,
        ..GameInfo::default()
    };
    ffi.client.register(visibility, port, info);
    0
}

/// Start a listing pass; the result lands in the client's game list
#[no_mangle]
pub extern "C" fn rendezvous_client_get_listing(handle: *mut RendezvousClientHandle) -> i32 {
    let Some(ffi) = client_mut(handle) else {
        return -1;
    };
    ffi.client.get_listing();
    0
}

/// Number of games in the local game list
#[no_mangle]
pub extern "C" fn rendezvous_client_listing_count(handle: *mut RendezvousClientHandle) -> i32 {
    match client_mut(handle) {
        Some(ffi) => ffi.client.game_list().len() as i32,
        None => -1,
    }
}

/// Assigned join-key (empty until registered); free with rendezvous_free_string
#[no_mangle]
pub extern "C" fn rendezvous_client_join_key(handle: *mut RendezvousClientHandle) -> *mut c_char {
    match client_mut(handle) {
        Some(ffi) => rust_to_c_str(ffi.client.join_key()),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn rendezvous_client_connection_type(handle: *mut RendezvousClientHandle) -> RendezvousConnectionType {
    match client_mut(handle) {
        Some(ffi) => ffi.client.connection_type().into(),
        None => RendezvousConnectionType::Unknown,
    }
}

/// Begin joining a game by join-key; collect the result with
/// rendezvous_client_take_join_result
/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn rendezvous_client_connect_to_server(
    handle: *mut RendezvousClientHandle,
    join_key: *const c_char,
) -> i32 {
    let Some(ffi) = client_mut(handle) else {
        return -1;
    };
    let Some(join_key) = c_str_to_rust(join_key) else {
        set_last_error("Invalid join-key");
        return -1;
    };

    let finished = Rc::clone(&ffi.finished);
    match ffi
        .client
        .connect_to_server(&join_key, move |result| finished.borrow_mut().push_back(result))
    {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Take the oldest finished join. On success returns the connected socket
/// (the caller owns it) and sets `status` to Connected; otherwise returns
/// -1 and sets `status` to None or Failed (message in rendezvous_last_error).
#[no_mangle]
pub extern "C" fn rendezvous_client_take_join_result(
    handle: *mut RendezvousClientHandle,
    status: *mut JoinStatus,
) -> i64 {
    let set_status = |value: JoinStatus| {
        if !status.is_null() {
            unsafe { *status = value };
        }
    };

    let Some(ffi) = client_mut(handle) else {
        set_status(JoinStatus::Failed);
        return -1;
    };

    let next = ffi.finished.borrow_mut().pop_front();
    match next {
        None => {
            set_status(JoinStatus::None);
            -1
        }
        Some(JoinResult::Connected { stream, peer }) => {
            log::info!("[ffi] handing over connection to {}", peer);
            set_status(JoinStatus::Connected);
            into_raw_socket(stream)
        }
        Some(JoinResult::Failed(e)) => {
            set_last_error(&e.to_string());
            set_status(JoinStatus::Failed);
            -1
        }
    }
}

#[cfg(unix)]
fn into_raw_socket(stream: TcpStream) -> i64 {
    use std::os::unix::io::IntoRawFd;
    stream.into_raw_fd() as i64
}

#[cfg(windows)]
fn into_raw_socket(stream: TcpStream) -> i64 {
    use std::os::windows::io::IntoRawSocket;
    stream.into_raw_socket() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fresh_client_state() {
        let handle = rendezvous_client_create(std::ptr::null());
        assert!(!handle.is_null());

        let key = rendezvous_client_join_key(handle);
        assert_eq!(c_str_to_rust(key).as_deref(), Some(""));
        rendezvous_free_string(key);

        assert_eq!(rendezvous_client_connection_type(handle), RendezvousConnectionType::Unknown);
        assert_eq!(rendezvous_client_listing_count(handle), 0);

        let mut status = JoinStatus::Failed;
        assert_eq!(rendezvous_client_take_join_result(handle, &mut status), -1);
        assert_eq!(status, JoinStatus::None);

        rendezvous_client_free(handle);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let json = CString::new("{ not json").unwrap();
        assert!(rendezvous_client_create(json.as_ptr()).is_null());
        let err = rendezvous_last_error();
        assert!(c_str_to_rust(err).unwrap().starts_with("Invalid configuration"));
        rendezvous_free_string(err);
    }

    #[test]
    fn test_null_handle() {
        assert_eq!(rendezvous_client_send_receive(std::ptr::null_mut()), -1);
        assert_eq!(rendezvous_client_listing_count(std::ptr::null_mut()), -1);
        assert!(rendezvous_client_join_key(std::ptr::null_mut()).is_null());
    }

    #[test]
    fn test_join_failure_is_collected() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let json = CString::new(format!(r#"{{"coordinator_server": "127.0.0.1:{}"}}"#, port)).unwrap();
        let handle = rendezvous_client_create(json.as_ptr());
        assert!(!handle.is_null());

        let key = CString::new("ABCD1234").unwrap();
        assert_eq!(rendezvous_client_connect_to_server(handle, key.as_ptr()), 0);
        assert_eq!(rendezvous_client_connect_to_server(handle, key.as_ptr()), -1);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut status = JoinStatus::None;
        while status == JoinStatus::None && Instant::now() < deadline {
            rendezvous_client_send_receive(handle);
            rendezvous_client_take_join_result(handle, &mut status);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(status, JoinStatus::Failed);

        rendezvous_client_free(handle);
    }
}
