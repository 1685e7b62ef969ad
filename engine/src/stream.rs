//! 引擎的命令流：单槽完成令牌串起的异步任务链。

use crate::{
    execution_failed,
    gpu::{Driver, Job},
    Error,
};
use rayon::ThreadPool;
use std::{
    mem::take,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
};

/// 入队的任务，失败结果记录在任务的完成令牌上。
pub(crate) type Task = Box<dyn FnOnce() -> Result<(), Error> + Send>;

type Continuation = Box<dyn FnOnce(&Result<(), Error>) + Send>;

/// 任务的执行者。
#[derive(Clone)]
pub(crate) enum Queue {
    /// CPU 引擎的线程池。
    Pool(Arc<ThreadPool>),
    /// 加速器的设备队列。
    Device(Arc<dyn Driver>),
    /// 设备之外的主机线程，用于主机回调。
    Host,
}

impl Queue {
    fn dispatch(&self, job: Job) {
        match self {
            Self::Pool(pool) => pool.spawn(job),
            Self::Device(driver) => driver.enqueue(job),
            Self::Host => rayon::spawn(job),
        }
    }
}

/// 完成令牌。
///
/// 完成前可以挂接后继；完成时按挂接顺序唤醒后继，结果保留供等待者读取。
#[derive(Clone)]
pub(crate) struct Event(Arc<Signal>);

struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

enum State {
    Pending(Vec<Continuation>),
    Done(Result<(), Error>),
}

impl Event {
    fn new() -> Self {
        Self(Arc::new(Signal {
            state: Mutex::new(State::Pending(Vec::new())),
            cond: Condvar::new(),
        }))
    }

    fn complete(&self, result: Result<(), Error>) {
        let mut state = self.0.state.lock().unwrap();
        let State::Pending(continuations) = &mut *state else {
            unreachable!("event completed twice")
        };
        let continuations = take(continuations);
        *state = State::Done(result.clone());
        drop(state);
        self.0.cond.notify_all();

        for f in continuations {
            f(&result)
        }
    }

    /// 在令牌完成后调用 `f`；已经完成则立即调用。
    fn then(&self, f: Continuation) {
        let mut state = self.0.state.lock().unwrap();
        match &mut *state {
            State::Pending(continuations) => continuations.push(f),
            State::Done(result) => {
                let result = result.clone();
                drop(state);
                f(&result)
            }
        }
    }

    /// 阻塞直到令牌完成，返回任务结果。
    pub fn wait(&self) -> Result<(), Error> {
        let mut state = self.0.state.lock().unwrap();
        loop {
            match &*state {
                State::Pending(_) => state = self.0.cond.wait(state).unwrap(),
                State::Done(result) => return result.clone(),
            }
        }
    }

    #[inline]
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// 单设备的任务链。
///
/// 只记录最后一个未完成的令牌。每个新任务先依赖它，再取代它，
/// 因此同一条链上的任务按提交顺序执行。
#[derive(Default)]
pub(crate) struct CommandStream {
    last: Mutex<Option<Event>>,
}

impl CommandStream {
    /// 将任务挂到链尾，由 `queue` 执行。不阻塞。
    ///
    /// 前驱失败时任务不执行，直接继承前驱的错误，使错误传递到链尾。
    /// 继承也经过队列派发，长链上的传递不会在一个线程的栈上嵌套。
    pub fn submit(&self, queue: &Queue, task: Task) -> Event {
        let event = Event::new();
        let signal = event.clone();
        let queue = queue.clone();
        let start: Continuation = Box::new(move |prev| {
            let job: Job = match prev {
                Err(e) => {
                    let e = e.clone();
                    drop(task);
                    Box::new(move || signal.complete(Err(e)))
                }
                Ok(()) => Box::new(move || signal.complete(run(task))),
            };
            queue.dispatch(job)
        });

        let mut last = self.last.lock().unwrap();
        match last.replace(event.clone()) {
            Some(prev) => prev.then(start),
            None => start(&Ok(())),
        }
        event
    }

    /// 阻塞直到链上所有任务完成，清空链并返回链上的第一个错误。
    pub fn wait(&self) -> Result<(), Error> {
        let Some(event) = self.last.lock().unwrap().clone() else {
            return Ok(());
        };
        let result = event.wait();

        let mut last = self.last.lock().unwrap();
        if last.as_ref().is_some_and(|e| e.same(&event)) {
            *last = None
        }
        result
    }

    /// 链上没有未报告的任务。
    pub fn is_idle(&self) -> bool {
        self.last.lock().unwrap().is_none()
    }
}

fn run(task: Task) -> Result<(), Error> {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(execution_failed(format!("task panicked: {msg}")))
        }
    }
}
