//! Wire format of the raw records emitted by the kernel producer.
//!
//! The messages are declared by hand with `prost` derives so the kernel side
//! can build them without a protobuf toolchain. Every record names the
//! operation (`kind`), the acting process, the kernel timestamp and the
//! subject credentials; the operation specific data travels in `payload`.
//!
//! Credential fields use [`ID_UNSET`](crate::constants::ID_UNSET) for values
//! the kernel could not observe.

/// One notification from the kernel hook.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KernelRecord {
    #[prost(enumeration = "RecordKind", tag = "1")]
    pub kind: i32,
    /// Acting process. For `Fork` this is the parent.
    #[prost(int32, tag = "2")]
    pub pid: i32,
    #[prost(message, optional, tag = "3")]
    pub ts: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub subject: ::core::option::Option<Credentials>,
    /// The kernel caller is blocked until it receives an admission decision.
    #[prost(bool, tag = "5")]
    pub authorize: bool,
    #[prost(oneof = "kernel_record::Payload", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18")]
    pub payload: ::core::option::Option<kernel_record::Payload>,
}

pub mod kernel_record {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Fork(super::ForkPayload),
        #[prost(message, tag = "11")]
        Exec(super::ExecPayload),
        #[prost(message, tag = "12")]
        Interpreter(super::InterpreterPayload),
        #[prost(message, tag = "13")]
        Chdir(super::ChdirPayload),
        #[prost(message, tag = "14")]
        Exit(super::ExitPayload),
        #[prost(message, tag = "15")]
        File(super::FilePayload),
        #[prost(message, tag = "16")]
        ProcessAccess(super::ProcessAccessPayload),
        #[prost(message, tag = "17")]
        Socket(super::SocketPayload),
        #[prost(message, tag = "18")]
        Service(super::ServicePayload),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RecordKind {
    Unspecified = 0,
    Fork = 1,
    Exec = 2,
    ExecInterpreter = 3,
    Chdir = 4,
    Exit = 5,
    FileAccess = 6,
    ProcessAccess = 7,
    SocketListen = 8,
    SocketAccept = 9,
    SocketConnect = 10,
    ServiceAdd = 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileOperation {
    Open = 0,
    Write = 1,
    Close = 2,
    Rename = 3,
    Unlink = 4,
}

/// Process credentials as seen by the kernel at the time of the record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Credentials {
    #[prost(uint32, tag = "1")]
    pub auid: u32,
    #[prost(uint32, tag = "2")]
    pub euid: u32,
    #[prost(uint32, tag = "3")]
    pub egid: u32,
    #[prost(uint32, tag = "4")]
    pub ruid: u32,
    #[prost(uint32, tag = "5")]
    pub rgid: u32,
    #[prost(int32, tag = "6")]
    pub sid: i32,
    /// Controlling terminal device, `u64::MAX` when there is none.
    #[prost(uint64, tag = "7")]
    pub tty: u64,
    /// Peer address of the session, empty when local.
    #[prost(string, tag = "8")]
    pub addr: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileStat {
    #[prost(uint64, tag = "1")]
    pub dev: u64,
    #[prost(uint64, tag = "2")]
    pub ino: u64,
    #[prost(uint32, tag = "3")]
    pub mode: u32,
    #[prost(uint32, tag = "4")]
    pub uid: u32,
    #[prost(uint32, tag = "5")]
    pub gid: u32,
    #[prost(uint64, tag = "6")]
    pub size: u64,
    #[prost(message, optional, tag = "7")]
    pub mtime: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "8")]
    pub ctime: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "9")]
    pub btime: ::core::option::Option<::prost_types::Timestamp>,
}

/// An executable file; `stat` is absent when the kernel could not stat it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub stat: ::core::option::Option<FileStat>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForkPayload {
    #[prost(int32, tag = "1")]
    pub child_pid: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecPayload {
    #[prost(message, optional, tag = "1")]
    pub image: ::core::option::Option<FileInfo>,
    #[prost(string, repeated, tag = "2")]
    pub argv: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "3")]
    pub env: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "4")]
    pub cwd: ::prost::alloc::string::String,
    /// The image is a script; an `ExecInterpreter` record follows.
    #[prost(bool, tag = "5")]
    pub interpreter_pending: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InterpreterPayload {
    #[prost(message, optional, tag = "1")]
    pub image: ::core::option::Option<FileInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChdirPayload {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExitPayload {
    #[prost(int32, tag = "1")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilePayload {
    #[prost(enumeration = "FileOperation", tag = "1")]
    pub op: i32,
    #[prost(string, tag = "2")]
    pub path: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub new_path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessAccessPayload {
    #[prost(int32, tag = "1")]
    pub object_pid: i32,
    #[prost(string, tag = "2")]
    pub method: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SocketPayload {
    /// IP protocol number (6 = TCP, 17 = UDP), 0 when unknown.
    #[prost(uint32, tag = "1")]
    pub protocol: u32,
    #[prost(string, tag = "2")]
    pub sock_addr: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub sock_port: u32,
    #[prost(string, tag = "4")]
    pub peer_addr: ::prost::alloc::string::String,
    #[prost(uint32, tag = "5")]
    pub peer_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServicePayload {
    #[prost(string, tag = "1")]
    pub plist_path: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub program_path: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub program_rpath: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "4")]
    pub program_argv: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// The registering process is unknown (e.g. file dropped offline).
    #[prost(bool, tag = "5")]
    pub no_subject: bool,
}
